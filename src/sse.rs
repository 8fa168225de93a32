//! Incremental Server-Sent Events decoder.
//!
//! Bytes arrive in arbitrary chunks; complete lines are processed as they
//! become available. `data:` lines accumulate until a blank line ends the
//! message. Comment lines (leading `:`) are ignored.

use tracing::warn;

/// Longest line kept in memory. A maximum-size relayed body is about 34 MB
/// once base64 encoded and wrapped in the event JSON.
pub const MAX_LINE_BYTES: usize = 48 * 1024 * 1024;

/// One dispatched SSE message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug)]
pub struct SseDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a newline.
    scanned: usize,
    max_line: usize,
    /// Set while skipping the tail of an oversized line.
    discarding: bool,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
            event: None,
            id: None,
            data: Vec::new(),
        }
    }

    /// Feeds a chunk and returns every message completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            self.scanned = end + 1;
            let line_start = start;
            start = end + 1;

            if self.discarding {
                self.discarding = false;
                continue;
            }
            let mut line = &self.buf[line_start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(msg) = self.process_line(&line) {
                out.push(msg);
            }
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.discarding || self.buf.len() > self.max_line {
            if !self.discarding {
                warn!(limit = self.max_line, "discarding oversized SSE line");
                // The message the line belonged to is incomplete.
                self.data.clear();
                self.event = None;
                self.discarding = true;
            }
            self.buf.clear();
            self.scanned = 0;
        }
        out
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // `retry` and unknown fields are ignored.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let msg = SseMessage {
            event: self.event.take(),
            id: self.id.clone(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(msg)
    }
}
