//! Newline framing over a raw byte stream.

/// Accumulates bytes and yields complete lines.
///
/// Lines longer than `max_len` are dropped in full rather than split, since
/// a truncated JSON frame could never decode anyway.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_len: usize,
    overflowed: bool,
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            max_len,
            overflowed: false,
        }
    }

    /// Feeds a chunk and returns every line it completed, without the
    /// terminator. A trailing `\r` is stripped and invalid UTF-8 is replaced.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.overflowed {
                    tracing::warn!(max_len = self.max_len, "dropping oversized frame");
                    self.overflowed = false;
                } else {
                    if self.buffer.last() == Some(&b'\r') {
                        self.buffer.pop();
                    }
                    lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                }
                self.buffer.clear();
                continue;
            }

            if self.buffer.len() >= self.max_len {
                self.overflowed = true;
                self.buffer.clear();
            }
            if !self.overflowed {
                self.buffer.push(byte);
            }
        }
        lines
    }
}
