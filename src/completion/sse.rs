//! Server-sent event decoding for chat completion streams
//!
//! Bytes are buffered until a full line is available, so multi-byte UTF-8
//! sequences split across network chunks are decoded intact. Only `data:`
//! lines matter to the completion protocol; comments, `event:` and `id:`
//! fields are skipped.

use crate::error::ChatshardError;
use serde::Deserialize;

/// Sentinel payload that ends a completion stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Incremental fragments carried by one `data:` line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Answer text fragment
    pub content: Option<String>,
    /// Reasoning text fragment
    pub reasoning_content: Option<String>,
}

impl Delta {
    /// True when the line carried no text at all
    pub fn is_empty(&self) -> bool {
        self.content.as_deref().map_or(true, str::is_empty)
            && self.reasoning_content.as_deref().map_or(true, str::is_empty)
    }
}

/// One decoded line of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A data line with its delta
    Delta(Delta),
    /// The `[DONE]` sentinel
    Done,
    /// A data line whose payload could not be decoded
    Malformed(String),
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Line splitter that keeps partial lines across chunks
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk and return the events of every completed line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = decode_line(&line[..line.len() - 1]) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the body has ended
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line)
    }
}

fn decode_line(raw: &[u8]) -> Option<SseEvent> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line,
        Err(e) => {
            return Some(SseEvent::Malformed(format!("invalid UTF-8: {}", e)));
        }
    };

    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(SseEvent::Done);
    }
    Some(match parse_payload(payload) {
        Ok(delta) => SseEvent::Delta(delta),
        Err(ChatshardError::MalformedChunk(msg)) => SseEvent::Malformed(msg),
        Err(other) => SseEvent::Malformed(other.to_string()),
    })
}

/// Extract `choices[0].delta` from one JSON payload
pub fn parse_payload(payload: &str) -> std::result::Result<Delta, ChatshardError> {
    let chunk: ChunkPayload = serde_json::from_str(payload)
        .map_err(|e| ChatshardError::MalformedChunk(format!("{}: {}", e, payload)))?;

    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .map(|delta| Delta {
            content: delta.content,
            reasoning_content: delta.reasoning_content,
        })
        .unwrap_or_default();
    Ok(delta)
}
