// src/sse.rs
//! Server-sent event framing shared by the chat endpoint, the chat client and
//! the upstream Gemini stream.
//!
//! A frame is UTF-8 text terminated by a blank line. Each line of the frame
//! that carries a payload starts with `data: `. Bytes are buffered until a
//! complete frame is available, so a read that ends in the middle of a frame
//! (or in the middle of a multi-byte character) is simply kept for the next
//! read.

use serde::{Deserialize, Serialize};

pub const DATA_PREFIX: &str = "data:";

/// Payload of one chat stream frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamFrame {
    pub fn chunk(text: impl Into<String>) -> Self {
        Self {
            chunk: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn done(full_response: impl Into<String>) -> Self {
        Self {
            chunk: Some(String::new()),
            done: true,
            full_response: Some(full_response.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, full_response: impl Into<String>) -> Self {
        Self {
            chunk: Some(String::new()),
            done: true,
            full_response: Some(full_response.into()),
            error: Some(error.into()),
        }
    }

    /// Wire form: `data: <json>\n\n`.
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and bools cannot fail.
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{} {}\n\n", DATA_PREFIX, json)
    }
}

/// Incremental frame splitter.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a read and returns the data payloads of every frame it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some((end, delimiter_len)) = find_delimiter(&self.buffer, self.scanned) {
            let frame: Vec<u8> = self.buffer.drain(..end + delimiter_len).collect();
            self.scanned = 0;
            if let Some(payload) = frame_payload(&frame[..end]) {
                payloads.push(payload);
            }
        }
        self.scanned = self.buffer.len();
        payloads
    }

    /// Drains whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        frame_payload(&rest)
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Earliest blank line (`\n\n` or `\r\n\r\n`) whose final byte sits at or
/// after `from`. Returns its start and length.
fn find_delimiter(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    (from.max(1)..buffer.len()).find_map(|i| {
        if buffer[i] != b'\n' {
            None
        } else if buffer[i - 1] == b'\n' {
            Some((i - 1, 2))
        } else if i >= 3 && &buffer[i - 3..i] == b"\r\n\r" {
            Some((i - 3, 4))
        } else {
            None
        }
    })
}

/// Joins the `data:` lines of one frame. Frames without data lines (comments,
/// keep-alives) yield `None`.
fn frame_payload(frame: &[u8]) -> Option<String> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "dropping frame with invalid UTF-8");
            return None;
        }
    };

    let lines: Vec<&str> = text
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix(DATA_PREFIX))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
