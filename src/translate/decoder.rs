//! Frame decoding.
//!
//! [`FrameDecoder`] turns raw upstream frames into [`ProviderEvent`]s.
//! It buffers bytes across frame boundaries, reassembles complete SSE lines
//! and parses each `data:` payload as JSON. Payloads that are not JSON are
//! dropped; only the `[DONE]` sentinel terminates the stream.

use serde_json::Value;

use crate::config::ProviderKind;
use crate::upstream::RawFrame;

/// Pending-line cap. A line longer than this without a newline is dropped.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Cap for a whole-body blob.
const MAX_BLOB_BYTES: usize = 16 * 1024 * 1024;

/// How a provider frames its events on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Line-delimited `data:` envelopes.
    Sse,
    /// One JSON document for the whole turn, available when the body ends.
    Blob,
}

impl From<ProviderKind> for Framing {
    fn from(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Blob => Framing::Blob,
            _ => Framing::Sse,
        }
    }
}

/// A decoded upstream event, still in the provider's own schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Data {
        /// Name from a preceding `event:` line, if any.
        event: Option<String>,
        payload: Value,
    },
    /// The `[DONE]` completion sentinel.
    Done,
}

impl ProviderEvent {
    pub fn data(payload: Value) -> Self {
        ProviderEvent::Data {
            event: None,
            payload,
        }
    }
}

/// Incremental decoder for one turn.
pub struct FrameDecoder {
    framing: Framing,
    buffer: Vec<u8>,
    event_name: Option<String>,
    done: bool,
    /// Set once a blob body overflows; the rest of the turn is ignored.
    discarded: bool,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            event_name: None,
            done: false,
            discarded: false,
        }
    }

    /// Feed one frame and return the events it completed.
    pub fn push(&mut self, frame: &RawFrame) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        self.push_bytes(&frame.payload, &mut events);
        events
    }

    /// Signal end of input. Flushes the unterminated tail (SSE) or parses
    /// the accumulated body (blob).
    pub fn finish(&mut self) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        if self.done || self.discarded {
            return events;
        }

        match self.framing {
            Framing::Sse => self.flush_buffer(&mut events),
            Framing::Blob => {
                let body = std::mem::take(&mut self.buffer);
                self.decode_blob(&body, &mut events);
            }
        }
        events
    }

    fn push_bytes(&mut self, bytes: &[u8], events: &mut Vec<ProviderEvent>) {
        if self.done || self.discarded {
            return;
        }

        match self.framing {
            Framing::Blob => {
                if self.buffer.len() + bytes.len() > MAX_BLOB_BYTES {
                    tracing::warn!(
                        buffered = self.buffer.len(),
                        "blob body exceeds cap, discarding"
                    );
                    self.buffer = Vec::new();
                    self.discarded = true;
                    return;
                }
                self.buffer.extend_from_slice(bytes);
            }
            Framing::Sse => {
                self.buffer.extend_from_slice(bytes);

                let mut start = 0;
                while let Some(pos) = self.buffer[start..].iter().position(|&b| b == b'\n') {
                    let end = start + pos;
                    let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
                    start = end + 1;
                    self.process_line(&line, events);
                    if self.done {
                        self.buffer.clear();
                        return;
                    }
                }
                self.buffer.drain(..start);

                if self.buffer.len() > MAX_PENDING_BYTES {
                    tracing::warn!(
                        buffered = self.buffer.len(),
                        "unterminated SSE line exceeds cap, discarding"
                    );
                    self.buffer.clear();
                }
            }
        }
    }

    fn flush_buffer(&mut self, events: &mut Vec<ProviderEvent>) {
        if self.buffer.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        self.process_line(&line, events);
    }

    /// Process a single complete SSE line.
    fn process_line(&mut self, line: &str, events: &mut Vec<ProviderEvent>) {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            // Event boundary
            self.event_name = None;
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            self.process_data(data, events);
            return;
        }
        // Some upstreams stream bare NDJSON without the `data:` envelope.
        if line.starts_with('{') {
            self.process_data(line, events);
        }
    }

    /// Process the data payload of a `data:` line.
    fn process_data(&mut self, data: &str, events: &mut Vec<ProviderEvent>) {
        let data = data.trim_end();
        if data == "[DONE]" {
            self.done = true;
            events.push(ProviderEvent::Done);
            return;
        }
        if data.is_empty() {
            return;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(payload) => events.push(ProviderEvent::Data {
                event: self.event_name.clone(),
                payload,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecodable frame payload");
            }
        }
    }

    fn decode_blob(&mut self, body: &[u8], events: &mut Vec<ProviderEvent>) {
        let trimmed = body.trim_ascii();
        if trimmed.is_empty() {
            return;
        }

        match serde_json::from_slice::<Value>(trimmed) {
            Ok(payload) => events.push(ProviderEvent::data(payload)),
            Err(_) => {
                // Captured bodies are sometimes a recorded SSE stream.
                self.framing = Framing::Sse;
                self.push_bytes(trimmed, events);
                self.flush_buffer(events);
            }
        }
    }
}
