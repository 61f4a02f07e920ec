//! Context-aware JSON decoder
//!
//! Decodes a stream of JSON values and, when a value cannot be decoded,
//! reports the input that was read for it, with the offending character
//! visibly marked.

use std::io::{self, Read};

use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::{DecodeError, DecodeErrorKind};
use crate::memento::ReplayBuffer;

/// How many bytes past the current read position an error snippet may reach.
pub const CONTEXT_MARGIN: u64 = 100;

/// JSON stream decoder remembering the input of the value being decoded.
pub struct Decoder<R> {
    replay: ReplayBuffer<R>,
    /// Absolute offset just past the last successfully decoded value
    consumed: u64,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            replay: ReplayBuffer::new(reader),
            consumed: 0,
        }
    }

    /// Decode the next JSON value from the stream.
    ///
    /// On failure the stream stays positioned at the start of the failed
    /// value, so decoding again reports the same error.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<T, DecodeError> {
        self.replay.mark(self.consumed);
        self.replay.rewind();
        let checkpoint = self.replay.checkpoint();
        trace!(checkpoint, "decoding next value");

        let (result, value_end) = {
            let mut stream = serde_json::Deserializer::from_reader(&mut self.replay).into_iter::<T>();
            let result = stream.next();
            (result, stream.byte_offset())
        };

        match result {
            Some(Ok(value)) => {
                self.consumed = checkpoint + value_end as u64;
                Ok(value)
            }
            Some(Err(err)) => Err(self.annotate(err)),
            None => {
                let err = serde_json::Error::io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of stream while waiting for a value",
                ));
                Err(self.annotate_as(DecodeErrorKind::Eof, err))
            }
        }
    }

    /// Consume the decoder, returning the wrapped reader.
    pub fn into_inner(self) -> R {
        self.replay.into_inner()
    }

    fn annotate(&self, err: serde_json::Error) -> DecodeError {
        let kind = DecodeErrorKind::from(err.classify());
        self.annotate_as(kind, err)
    }

    fn annotate_as(&self, kind: DecodeErrorKind, err: serde_json::Error) -> DecodeError {
        let window = self.replay.memento(self.replay.offset() + CONTEXT_MARGIN);
        let position = match kind {
            DecodeErrorKind::Syntax => self.replay.offset_of(err.line(), err.column()),
            _ => None,
        };
        let snippet = match position {
            Some(offset) => {
                let at = usize::try_from(offset - self.replay.checkpoint()).unwrap_or(usize::MAX);
                mark_position(window, at)
            }
            None => String::from_utf8_lossy(window).into_owned(),
        };
        trace!(?kind, "decode failed");
        DecodeError::new(kind, err, snippet)
    }
}

/// Render `window` as text with `►`/`◄` around the character at byte `at`.
///
/// When `at` points into the middle of a UTF-8 sequence, the whole character
/// gets marked.
fn mark_position(window: &[u8], at: usize) -> String {
    if at >= window.len() {
        return String::from_utf8_lossy(window).into_owned();
    }
    let mut start = at;
    while start > 0 && at - start < 3 && is_continuation(window[start]) {
        start -= 1;
    }
    if is_continuation(window[start]) {
        start = at;
    }
    let end = start + utf8_width(window[start]).min(window.len() - start);
    format!(
        "{}►{}◄{}",
        String::from_utf8_lossy(&window[..start]),
        String::from_utf8_lossy(&window[start..end]),
        String::from_utf8_lossy(&window[end..]),
    )
}

fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

fn utf8_width(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}
