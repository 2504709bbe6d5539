//! Output emitter.
//!
//! Turns the normalized [`Delta`] sequence into OpenAI-style chunks with a
//! `NotStarted -> Streaming -> Finished` state machine. The first chunk
//! carrying text also carries the assistant role; a final delta produces
//! exactly one `finish_reason: "stop"` chunk followed by the `[DONE]`
//! sentinel. Input after that is ignored.

use bytes::Bytes;

use super::delta::{Delta, Phase};
use crate::config::ThinkingStyle;
use crate::proxy::types::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ChunkDelta, Message,
};

/// Opening delimiter of a thinking segment.
pub const THINKING_OPEN: &str = "<thinking>\n";
/// Closing delimiter of a thinking segment.
pub const THINKING_CLOSE: &str = "\n</thinking>\n\n";

const ASSISTANT: &str = "assistant";
const FINISH_STOP: &str = "stop";

/// Emitter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    NotStarted,
    Streaming,
    Finished,
}

/// One unit on the outward stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OutwardChunk {
    Chunk(ChatCompletionChunk),
    /// Terminal `[DONE]` sentinel.
    Done,
}

impl OutwardChunk {
    /// Encode as one SSE frame.
    pub fn to_sse(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            OutwardChunk::Chunk(chunk) => {
                let json = serde_json::to_string(chunk)?;
                Ok(Bytes::from(format!("data: {}\n\n", json)))
            }
            OutwardChunk::Done => Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        }
    }

    pub fn as_chunk(&self) -> Option<&ChatCompletionChunk> {
        match self {
            OutwardChunk::Chunk(chunk) => Some(chunk),
            OutwardChunk::Done => None,
        }
    }
}

/// Per-turn chunk writer.
pub struct Emitter {
    id: String,
    created: u64,
    model: String,
    style: ThinkingStyle,
    state: EmitterState,
    thinking: String,
    thinking_open: bool,
}

impl Emitter {
    /// New emitter with a fresh chunk id and the current time.
    pub fn new(model: impl Into<String>, style: ThinkingStyle) -> Self {
        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        let created = chrono::Utc::now().timestamp().max(0) as u64;
        Self::with_identity(id, created, model, style)
    }

    pub fn with_identity(
        id: impl Into<String>,
        created: u64,
        model: impl Into<String>,
        style: ThinkingStyle,
    ) -> Self {
        Self {
            id: id.into(),
            created,
            model: model.into(),
            style,
            state: EmitterState::NotStarted,
            thinking: String::new(),
            thinking_open: false,
        }
    }

    pub fn state(&self) -> EmitterState {
        self.state
    }

    /// Write one delta; returns the chunks it produced.
    pub fn push(&mut self, delta: Delta) -> Vec<OutwardChunk> {
        let mut out = Vec::new();
        if self.state == EmitterState::Finished {
            tracing::debug!("write after finish ignored");
            return out;
        }

        if delta.phase == Phase::Thinking && !delta.is_final {
            self.push_thinking(delta.text, &mut out);
            return out;
        }

        let mut text = self.close_thinking(&mut out);
        text.push_str(&delta.text);

        if delta.is_final {
            out.push(self.finish_chunk(text));
            out.push(OutwardChunk::Done);
            self.state = EmitterState::Finished;
        } else if !text.is_empty() {
            out.push(self.content_chunk(text, None));
        }
        out
    }

    fn push_thinking(&mut self, text: String, out: &mut Vec<OutwardChunk>) {
        match self.style {
            ThinkingStyle::Hidden => {}
            ThinkingStyle::Buffered => self.thinking.push_str(&text),
            ThinkingStyle::Streamed => {
                if text.is_empty() {
                    return;
                }
                let text = if self.thinking_open {
                    text
                } else {
                    self.thinking_open = true;
                    format!("{}{}", THINKING_OPEN, text)
                };
                out.push(self.content_chunk(text, None));
            }
        }
    }

    /// End an open thinking segment. Buffered thinking is flushed as its
    /// own chunk; a streamed segment's closing delimiter is returned so it
    /// prefixes the next answer text.
    fn close_thinking(&mut self, out: &mut Vec<OutwardChunk>) -> String {
        match self.style {
            ThinkingStyle::Buffered if !self.thinking.is_empty() => {
                let body = std::mem::take(&mut self.thinking);
                let wrapped = format!("{}{}{}", THINKING_OPEN, body, THINKING_CLOSE);
                out.push(self.content_chunk(wrapped, None));
                String::new()
            }
            ThinkingStyle::Streamed if self.thinking_open => {
                self.thinking_open = false;
                THINKING_CLOSE.to_string()
            }
            _ => String::new(),
        }
    }

    fn content_chunk(&mut self, text: String, finish_reason: Option<&str>) -> OutwardChunk {
        let role = if self.state == EmitterState::NotStarted {
            self.state = EmitterState::Streaming;
            Some(ASSISTANT.to_string())
        } else {
            None
        };
        self.chunk(
            ChunkDelta {
                role,
                content: Some(text),
            },
            finish_reason,
        )
    }

    fn finish_chunk(&mut self, text: String) -> OutwardChunk {
        if text.is_empty() {
            self.chunk(ChunkDelta::default(), Some(FINISH_STOP))
        } else {
            self.content_chunk(text, Some(FINISH_STOP))
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&str>) -> OutwardChunk {
        OutwardChunk::Chunk(ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        })
    }
}

/// Fold a turn's chunks into a single non-streaming response.
pub fn collect_response(chunks: &[OutwardChunk], model: &str) -> ChatCompletionResponse {
    let mut id = None;
    let mut created = 0;
    let mut content = String::new();
    let mut finish_reason = None;

    for chunk in chunks.iter().filter_map(OutwardChunk::as_chunk) {
        id.get_or_insert_with(|| chunk.id.clone());
        created = chunk.created;
        if let Some(text) = chunk.content() {
            content.push_str(text);
        }
        if let Some(reason) = chunk.finish_reason() {
            finish_reason = Some(reason.to_string());
        }
    }

    ChatCompletionResponse {
        id: id.unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message::new(ASSISTANT, content),
            finish_reason,
        }],
    }
}
