//! Incremental decoder for SSE-style response streams.
//!
//! Bytes arrive in arbitrary chunks. They are decoded as UTF-8 (a code point
//! may straddle two chunks), buffered until a blank line closes a frame, and
//! each `data:` line of a complete frame yields one text increment.

use serde::Deserialize;

/// Payload marking the logical end of a stream.
pub const STREAM_END_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

#[derive(Debug, Deserialize)]
struct Fragment {
    #[serde(default)]
    response: String,
}

/// Turns raw response chunks into text increments, in arrival order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// Decoded text not yet closed by a blank line.
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the increments of every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode_utf8(chunk);

        let mut increments = Vec::new();
        while let Some((end, delimiter_len)) = frame_boundary(&self.buffer) {
            let frame: String = self.buffer.drain(..end + delimiter_len).collect();
            extract_increments(&frame[..end], &mut increments);
        }
        increments
    }

    /// Flush whatever is buffered once the byte stream has closed.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }

        let mut increments = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        extract_increments(&rest, &mut increments);
        increments
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        let mut input = self.pending.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    self.buffer.push_str(valid);
                    input = &[];
                    break;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    self.buffer
                        .push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        // Invalid sequence: replace it and keep going.
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        // Incomplete sequence: wait for the next chunk.
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }

        let rest = input.to_vec();
        self.pending = rest;
    }
}

/// Position and length of the first blank-line delimiter.
fn frame_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\n\r\n").map(|i| (i, 3));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn extract_increments(frame: &str, out: &mut Vec<String>) {
    for line in frame.lines() {
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.trim() == STREAM_END_SENTINEL {
            continue;
        }

        let text = match serde_json::from_str::<Fragment>(payload) {
            Ok(fragment) => fragment.response,
            Err(_) => payload.to_string(),
        };
        if !text.is_empty() {
            out.push(text);
        }
    }
}
