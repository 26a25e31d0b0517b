use bytes::{Buf, BytesMut};

/// Number of consecutive empty lines that end a message.
const MESSAGE_TERMINATOR_LINES: usize = 3;

/// Splits the streaming feed into configuration messages.
///
/// The feed is line oriented; a message is every non-empty line since the
/// previous message, concatenated, and ends with three consecutive empty
/// lines. Chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct MessageFramer {
    pending: BytesMut,
    body: String,
    empty_lines: usize,
    lines: u64,
}

impl MessageFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the messages it completed. An empty string
    /// is a message without a body.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let raw = self.pending.split_to(end);
            self.pending.advance(1);
            self.lines += 1;

            let text = String::from_utf8_lossy(&raw);
            let line = text.strip_suffix('\r').unwrap_or(&text);
            if line.is_empty() {
                self.empty_lines += 1;
                if self.empty_lines == MESSAGE_TERMINATOR_LINES {
                    messages.push(std::mem::take(&mut self.body));
                    self.empty_lines = 0;
                }
            } else {
                self.empty_lines = 0;
                self.body.push_str(line);
            }
        }
        messages
    }

    /// Lines read so far.
    #[must_use]
    pub fn lines(&self) -> u64 {
        self.lines
    }
}
