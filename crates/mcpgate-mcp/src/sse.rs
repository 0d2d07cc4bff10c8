//! Server-Sent Events (SSE) parser with line buffering.
//!
//! SSE lines can span multiple TCP packets, so bytes are buffered until a
//! complete line is available. Buffering happens on raw bytes so multi-byte
//! UTF-8 sequences split across chunks decode correctly.

use std::fmt;

/// Event name used for the message endpoint announcement.
pub const ENDPOINT_EVENT: &str = "endpoint";

/// Event name used for JSON-RPC payloads.
pub const MESSAGE_EVENT: &str = "message";

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The event type (from "event:" line)
    pub event: Option<String>,
    /// The event data (from "data:" lines)
    pub data: String,
    /// The event ID (from "id:" line)
    pub id: Option<String>,
    /// Retry value (from "retry:" line)
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Event type, defaulting to "message" as the SSE format specifies.
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or(MESSAGE_EVENT)
    }

    /// An event that only advances the last event id.
    pub fn is_id_only(&self) -> bool {
        self.data.is_empty() && self.id.is_some()
    }

    /// The id parsed as a number, if it is one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_deref().and_then(|id| id.trim().parse().ok())
    }
}

/// SSE parser that handles line buffering across TCP packets.
#[derive(Default)]
pub struct SseParser {
    /// Buffer for incomplete lines
    buffer: Vec<u8>,
    /// Current event being built
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
    current_retry: Option<u64>,
}

impl SseParser {
    /// Create a new SSE parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and return any complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        self.parse_buffer()
    }

    /// Flush a trailing event when the stream ends without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let mut events = Vec::new();
            self.handle_line(line.trim_end_matches('\r'), &mut events);
            if let Some(event) = events.pop() {
                return Some(event);
            }
        }
        self.finalize_event()
    }

    fn parse_buffer(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&raw[..newline_pos]);
            let line = line.trim_end_matches('\r');
            self.handle_line(line, &mut events);
        }

        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        // Empty line signals end of event
        if line.is_empty() {
            if let Some(event) = self.finalize_event() {
                events.push(event);
            }
            return;
        }

        // Some servers announce the message endpoint as a bare path
        if line.starts_with('/') {
            events.push(SseEvent {
                event: Some(ENDPOINT_EVENT.to_string()),
                data: line.trim().to_string(),
                id: None,
                retry: None,
            });
            return;
        }

        if let Some((field, value)) = Self::parse_field(line) {
            match field {
                "event" => self.current_event = Some(value.to_string()),
                "data" => self.current_data.push(value.to_string()),
                "id" => self.current_id = Some(value.to_string()),
                "retry" => {
                    if let Ok(ms) = value.parse() {
                        self.current_retry = Some(ms);
                    }
                }
                _ => {} // Ignore unknown fields
            }
        }
    }

    /// Parse a single SSE field line.
    fn parse_field(line: &str) -> Option<(&str, &str)> {
        // Lines starting with : are comments
        if line.starts_with(':') {
            return None;
        }

        match line.split_once(':') {
            Some((field, value)) => Some((field, value.strip_prefix(' ').unwrap_or(value))),
            None => Some((line, "")),
        }
    }

    /// Finalize the current event and reset state.
    fn finalize_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() && self.current_id.is_none() {
            self.current_event = None;
            self.current_retry = None;
            return None;
        }

        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
            retry: self.current_retry.take(),
        };

        self.current_data.clear();
        Some(event)
    }

    /// Check if there's any buffered data.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty() || !self.current_data.is_empty()
    }
}

impl fmt::Debug for SseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseParser")
            .field("buffer_len", &self.buffer.len())
            .field("current_data_lines", &self.current_data.len())
            .finish()
    }
}
