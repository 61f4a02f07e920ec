//! Replay buffer
//!
//! A reader that remembers every byte it pulls from its source since the last
//! checkpoint, so that decode failures can show the input around them.

use std::io::{self, Read};

/// Reader wrapping another reader and remembering what has been read since
/// the last [`mark`](ReplayBuffer::mark).
///
/// The source is read one chunk at a time; whatever a single source read
/// returns is buffered, even if the caller asked for less. Buffered bytes past
/// the read cursor (including those retained after a checkpoint) are handed
/// out before the source is read again.
pub struct ReplayBuffer<R> {
    /// Wrapped source reader
    reader: R,
    /// Bytes buffered since the checkpoint
    memento: Vec<u8>,
    /// Next byte in `memento` to hand out
    pos: usize,
    /// Absolute stream offset of `memento[0]`
    mark_offset: u64,
    /// Source error hit after a partial read, reported by the next read
    pending: Option<io::Error>,
}

/// Upper bound of a single read from the source.
const FILL_CHUNK: usize = 4096;

impl<R: Read> ReplayBuffer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            memento: Vec::new(),
            pos: 0,
            mark_offset: 0,
            pending: None,
        }
    }

    /// Start a new memory cycle at `offset`, forgetting everything before it.
    ///
    /// Offsets not newer than the current checkpoint leave the buffer alone.
    /// Never discards more than is actually buffered.
    pub fn mark(&mut self, offset: u64) {
        let trash = offset.saturating_sub(self.mark_offset);
        if trash == 0 {
            return;
        }
        let trash = usize::try_from(trash).unwrap_or(usize::MAX).min(self.memento.len());
        self.memento.drain(..trash);
        self.mark_offset += trash as u64;
        self.pos = 0;
    }

    /// Move the read cursor back to the checkpoint, so that all retained
    /// bytes are delivered again.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Bytes buffered since the checkpoint, up to the absolute `offset`
    /// (exclusive). Clipped to what is actually buffered, which may reach
    /// past [`offset`](Self::offset).
    pub fn memento(&self, offset: u64) -> &[u8] {
        let len = offset.saturating_sub(self.mark_offset);
        let len = usize::try_from(len).unwrap_or(usize::MAX).min(self.memento.len());
        &self.memento[..len]
    }

    /// Absolute offset of the current checkpoint.
    pub fn checkpoint(&self) -> u64 {
        self.mark_offset
    }

    /// Absolute offset of the next byte a read will deliver.
    pub fn offset(&self) -> u64 {
        self.mark_offset + self.pos as u64
    }

    /// Translate a 1-based `line` and byte `column`, counted from the
    /// checkpoint, into an absolute stream offset.
    ///
    /// Column 0 designates the newline terminating the previous line.
    /// Returns `None` when the position lies outside the buffered bytes.
    pub fn offset_of(&self, line: usize, column: usize) -> Option<u64> {
        if line == 0 {
            return None;
        }
        let mut line_start = 0usize;
        if line > 1 {
            let newline = self
                .memento
                .iter()
                .enumerate()
                .filter(|&(_, &b)| b == b'\n')
                .nth(line - 2)?
                .0;
            line_start = newline + 1;
        }
        let rel = (line_start + column).checked_sub(1)?;
        if rel >= self.memento.len() {
            return None;
        }
        Some(self.mark_offset + rel as u64)
    }

    /// Consume the buffer, returning the wrapped reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Pull one chunk from the source into the buffer.
    fn fill(&mut self) -> io::Result<usize> {
        if let Some(err) = self.pending.take() {
            return Err(err);
        }
        let mut chunk = [0u8; FILL_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(n) => {
                    self.memento.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Read for ReplayBuffer<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Short reads from the source are fine, keep going until the request
        // is satisfied or the source runs dry.
        let mut filled = 0;
        loop {
            let retained = &self.memento[self.pos..];
            let n = retained.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&retained[..n]);
            self.pos += n;
            filled += n;
            if filled == buf.len() {
                break;
            }
            match self.fill() {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if filled > 0 => {
                    self.pending = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}
