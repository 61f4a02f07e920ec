//! Decode errors

use std::fmt;

use serde_json::error::Category;

/// The kind of decode error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Malformed input
    Syntax,
    /// Input ended before a complete value was read
    Eof,
    /// Well-formed input not matching the requested type
    Data,
    /// Reading from the source failed
    Io,
}

impl From<Category> for DecodeErrorKind {
    fn from(category: Category) -> Self {
        match category {
            Category::Syntax => DecodeErrorKind::Syntax,
            Category::Eof => DecodeErrorKind::Eof,
            Category::Data => DecodeErrorKind::Data,
            Category::Io => DecodeErrorKind::Io,
        }
    }
}

/// A decode error carrying the input read while decoding the failed value
#[derive(Debug)]
pub struct DecodeError {
    kind: DecodeErrorKind,
    inner: serde_json::Error,
    snippet: String,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, inner: serde_json::Error, snippet: impl Into<String>) -> Self {
        Self {
            kind,
            inner,
            snippet: snippet.into(),
        }
    }

    pub fn kind(&self) -> DecodeErrorKind {
        self.kind
    }

    /// The input read so far, with `►`/`◄` bracketing the offending
    /// character when its position is known.
    pub fn snippet(&self) -> &str {
        &self.snippet
    }

    pub fn inner(&self) -> &serde_json::Error {
        &self.inner
    }

    pub fn into_inner(self) -> serde_json::Error {
        self.inner
    }

    pub fn is_syntax(&self) -> bool {
        self.kind == DecodeErrorKind::Syntax
    }

    pub fn is_eof(&self) -> bool {
        self.kind == DecodeErrorKind::Eof
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\nwhile reading:\n\t{}", self.inner, self.snippet)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}
