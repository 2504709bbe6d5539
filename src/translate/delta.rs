//! Canonical incremental unit passed from the normalizer to the emitter.

/// Whether text belongs to the model's reasoning or to its answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    Thinking,
    #[default]
    Answer,
}

/// One normalized piece of assistant output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub phase: Phase,
    pub text: String,
    pub is_final: bool,
    pub role: Option<String>,
}

impl Delta {
    /// A non-final text fragment.
    pub fn text(phase: Phase, text: impl Into<String>) -> Self {
        Self {
            phase,
            text: text.into(),
            is_final: false,
            role: None,
        }
    }

    /// Normal end of the turn.
    pub fn finished() -> Self {
        Self {
            phase: Phase::Answer,
            text: String::new(),
            is_final: true,
            role: None,
        }
    }

    /// Terminal delta carrying a failure message for the caller.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: Phase::Answer,
            text: message.into(),
            is_final: true,
            role: None,
        }
    }
}
