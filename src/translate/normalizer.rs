//! Phase classification and delta normalization.
//!
//! Each provider speaks its own event schema. A [`Strategy`] reads one
//! [`ProviderEvent`] and describes it as a list of [`Signal`]s; the
//! [`Normalizer`] applies those signals to the per-stream phase flag and
//! produces canonical [`Delta`]s. Rules, in priority order:
//!
//! 1. a phase marker flips the phase flag and emits nothing by itself
//! 2. text is emitted in the current phase (explicitly tagged text sets
//!    the flag first)
//! 3. completion emits one final delta; everything after it is ignored
//! 4. an upstream error emits one final delta carrying the message

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::decoder::ProviderEvent;
use super::delta::{Delta, Phase};
use crate::config::ProviderKind;

/// Provider-neutral meaning of (part of) an upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Explicit phase transition marker.
    PhaseChange(Phase),
    /// Output text; `None` means "whatever phase the stream is in".
    Text { phase: Option<Phase>, text: String },
    /// Upstream identifier the next turn must refer to.
    Linkage(String),
    /// Identifier of the prompt message. Used as linkage only until a
    /// reply identifier arrives.
    PromptLinkage(String),
    /// Normal end of the turn.
    Complete,
    /// The upstream reported a failure.
    Failed(String),
}

impl Signal {
    fn text(phase: Option<Phase>, text: &str) -> Option<Self> {
        if text.is_empty() {
            None
        } else {
            Some(Signal::Text {
                phase,
                text: text.to_string(),
            })
        }
    }
}

/// Per-provider event classification.
#[derive(Debug, Clone)]
pub enum Strategy {
    Openai,
    Deepseek {
        /// Target of the last patch op; bare `{"v": ...}` ops append here.
        path: Option<String>,
    },
    Kimi,
    Qwen,
    Blob,
}

impl From<ProviderKind> for Strategy {
    fn from(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Openai => Strategy::Openai,
            ProviderKind::Deepseek => Strategy::Deepseek { path: None },
            ProviderKind::Kimi => Strategy::Kimi,
            ProviderKind::Qwen => Strategy::Qwen,
            ProviderKind::Blob => Strategy::Blob,
        }
    }
}

impl Strategy {
    /// Describe one provider event as signals, in the order they apply.
    pub fn classify(&mut self, event: &ProviderEvent) -> Vec<Signal> {
        let (name, payload) = match event {
            ProviderEvent::Done => return vec![Signal::Complete],
            ProviderEvent::Data { event, payload } => (event.as_deref(), payload),
        };

        match self {
            Strategy::Openai => classify_openai(payload),
            Strategy::Deepseek { path } => classify_deepseek(path, payload),
            Strategy::Kimi => classify_kimi(name, payload),
            Strategy::Qwen => classify_qwen(payload),
            Strategy::Blob => classify_blob(payload),
        }
    }
}

/// Pull a human-readable message out of the usual error shapes.
fn error_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("msg"))
            .or_else(|| map.get("detail"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        Value::Null | Value::Bool(false) => None,
        other => Some(other.to_string()),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn classify_openai(payload: &Value) -> Vec<Signal> {
    if let Some(message) = payload.get("error").and_then(error_message) {
        return vec![Signal::Failed(message)];
    }

    let mut signals = Vec::new();
    let Some(choice) = payload.pointer("/choices/0") else {
        return signals;
    };

    if let Some(delta) = choice.get("delta").or_else(|| choice.get("message")) {
        let reasoning = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(Value::as_str);
        if let Some(signal) = reasoning.and_then(|t| Signal::text(Some(Phase::Thinking), t)) {
            signals.push(signal);
        }
        if let Some(signal) = delta
            .get("content")
            .and_then(Value::as_str)
            .and_then(|t| Signal::text(Some(Phase::Answer), t))
        {
            signals.push(signal);
        }
    }

    if choice
        .get("finish_reason")
        .is_some_and(|reason| !reason.is_null())
    {
        signals.push(Signal::Complete);
    }
    signals
}

fn classify_deepseek(path: &mut Option<String>, payload: &Value) -> Vec<Signal> {
    let mut signals = Vec::new();

    if let Some(code) = payload.get("code").and_then(Value::as_i64) {
        if code != 0 {
            let message = payload
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("upstream rejected the request");
            return vec![Signal::Failed(format!("{} (code {})", message, code))];
        }
    }
    if let Some(message) = payload.get("error").and_then(error_message) {
        return vec![Signal::Failed(message)];
    }

    if let Some(id) = payload.get("response_message_id").and_then(id_string) {
        signals.push(Signal::Linkage(id));
    }

    if let Some(p) = payload.get("p").and_then(Value::as_str) {
        *path = Some(p.to_string());
    }
    let Some(value) = payload.get("v") else {
        return signals;
    };

    if payload.get("o").and_then(Value::as_str) == Some("BATCH") {
        let prefix = path.clone().unwrap_or_default();
        for op in value.as_array().into_iter().flatten() {
            let Some(sub) = op.get("p").and_then(Value::as_str) else {
                continue;
            };
            let full = if prefix.is_empty() {
                sub.to_string()
            } else {
                format!("{}/{}", prefix, sub)
            };
            if let Some(v) = op.get("v") {
                signals.extend(deepseek_path_signal(&full, v));
            }
        }
        return signals;
    }

    match value {
        Value::Object(_) => {
            // Initial snapshot carrying the new message's identifiers.
            if let Some(id) = value.pointer("/response/message_id").and_then(id_string) {
                signals.push(Signal::Linkage(id));
            }
        }
        v => match path.as_deref() {
            Some(p) => signals.extend(deepseek_path_signal(p, v)),
            None => {
                if let Some(signal) = v.as_str().and_then(|t| Signal::text(None, t)) {
                    signals.push(signal);
                }
            }
        },
    }
    signals
}

fn deepseek_path_signal(path: &str, value: &Value) -> Option<Signal> {
    match path {
        "response/thinking_content" => value
            .as_str()
            .and_then(|t| Signal::text(Some(Phase::Thinking), t)),
        "response/content" => value
            .as_str()
            .and_then(|t| Signal::text(Some(Phase::Answer), t)),
        "response/thinking_elapsed_secs" => Some(Signal::PhaseChange(Phase::Answer)),
        "response/status" | "response/quasi_status" => match value.as_str() {
            Some("FINISHED") | Some("INCOMPLETE") => Some(Signal::Complete),
            Some("CONTENT_FILTER") => Some(Signal::Failed(
                "response blocked by upstream content filter".to_string(),
            )),
            _ => None,
        },
        _ => None,
    }
}

fn classify_kimi(name: Option<&str>, payload: &Value) -> Vec<Signal> {
    let event = payload.get("event").and_then(Value::as_str).or(name);
    let text = payload.get("text").and_then(Value::as_str).unwrap_or("");

    match event {
        Some("cmpl") => Signal::text(Some(Phase::Answer), text).into_iter().collect(),
        Some("k1") => Signal::text(Some(Phase::Thinking), text)
            .into_iter()
            .collect(),
        Some("all_done") => vec![Signal::Complete],
        Some("error") => {
            let message = payload
                .get("error")
                .and_then(error_message)
                .or_else(|| payload.get("message").and_then(error_message))
                .unwrap_or_else(|| "upstream reported an error".to_string());
            vec![Signal::Failed(message)]
        }
        Some("resp") => payload
            .get("id")
            .and_then(id_string)
            .map(Signal::Linkage)
            .into_iter()
            .collect(),
        Some("req") => payload
            .get("id")
            .and_then(id_string)
            .map(Signal::PromptLinkage)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn classify_qwen(payload: &Value) -> Vec<Signal> {
    if payload.get("success").and_then(Value::as_bool) == Some(false) {
        let message = payload
            .pointer("/data/details")
            .and_then(error_message)
            .or_else(|| payload.get("message").and_then(error_message))
            .unwrap_or_else(|| "upstream rejected the request".to_string());
        return vec![Signal::Failed(message)];
    }
    if let Some(message) = payload.get("error").and_then(error_message) {
        return vec![Signal::Failed(message)];
    }

    let mut signals = Vec::new();
    if let Some(id) = payload
        .get("response.created")
        .and_then(|created| created.get("response_id"))
        .and_then(id_string)
    {
        signals.push(Signal::Linkage(id));
    }

    let Some(delta) = payload.pointer("/choices/0/delta") else {
        return signals;
    };
    let phase = match delta.get("phase").and_then(Value::as_str) {
        Some("think") | Some("thinking_summary") => Some(Phase::Thinking),
        Some("answer") => Some(Phase::Answer),
        _ => None,
    };
    let content = delta.get("content").and_then(Value::as_str).unwrap_or("");
    let finished = delta.get("status").and_then(Value::as_str) == Some("finished");

    match Signal::text(phase, content) {
        Some(text) => signals.push(text),
        None => {
            if let Some(phase) = phase {
                signals.push(Signal::PhaseChange(phase));
            }
        }
    }

    if finished {
        if phase == Some(Phase::Thinking) {
            signals.push(Signal::PhaseChange(Phase::Answer));
        } else {
            signals.push(Signal::Complete);
        }
    }
    signals
}

fn think_tags() -> &'static Regex {
    static THINK: OnceLock<Regex> = OnceLock::new();
    THINK.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("static regex"))
}

fn classify_blob(payload: &Value) -> Vec<Signal> {
    if let Some(message) = payload.get("error").and_then(error_message) {
        return vec![Signal::Failed(message)];
    }

    let mut signals = Vec::new();
    if let Some(id) = payload
        .get("message_id")
        .or_else(|| payload.get("id"))
        .and_then(id_string)
    {
        signals.push(Signal::Linkage(id));
    }

    let content = payload
        .get("content")
        .or_else(|| payload.get("text"))
        .or_else(|| payload.get("message"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.as_str()),
            other => other.get("content").and_then(Value::as_str),
        })
        .unwrap_or("");

    let mut thinking: String = payload
        .get("reasoning_content")
        .or_else(|| payload.get("thinking"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let answer = if think_tags().is_match(content) {
        for caps in think_tags().captures_iter(content) {
            if !thinking.is_empty() {
                thinking.push('\n');
            }
            thinking.push_str(caps[1].trim());
        }
        think_tags()
            .replace_all(content, "")
            .trim_start()
            .to_string()
    } else {
        content.to_string()
    };

    signals.extend(Signal::text(Some(Phase::Thinking), &thinking));
    signals.extend(Signal::text(Some(Phase::Answer), &answer));
    signals.push(Signal::Complete);
    signals
}

/// How a normalized stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Still running.
    Open,
    Completed,
    Failed,
}

/// Per-stream normalizer.
pub struct Normalizer {
    strategy: Strategy,
    phase: Phase,
    outcome: Outcome,
    linkage: Option<String>,
    reply_linked: bool,
}

impl Normalizer {
    pub fn new(kind: ProviderKind) -> Self {
        Self::with_strategy(Strategy::from(kind))
    }

    pub fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            phase: Phase::Answer,
            outcome: Outcome::Open,
            linkage: None,
            reply_linked: false,
        }
    }

    /// Normalize one provider event.
    pub fn push(&mut self, event: &ProviderEvent) -> Vec<Delta> {
        if self.is_finished() {
            return Vec::new();
        }
        let signals = self.strategy.classify(event);
        self.apply(signals)
    }

    /// Apply already-classified signals in order.
    pub fn apply(&mut self, signals: Vec<Signal>) -> Vec<Delta> {
        let mut deltas = Vec::new();
        for signal in signals {
            if self.is_finished() {
                break;
            }
            match signal {
                Signal::PhaseChange(phase) => self.phase = phase,
                Signal::Text { phase, text } => {
                    if let Some(phase) = phase {
                        self.phase = phase;
                    }
                    deltas.push(Delta::text(self.phase, text));
                }
                Signal::Linkage(id) => {
                    self.linkage = Some(id);
                    self.reply_linked = true;
                }
                Signal::PromptLinkage(id) => {
                    if !self.reply_linked {
                        self.linkage = Some(id);
                    }
                }
                Signal::Complete => {
                    self.outcome = Outcome::Completed;
                    deltas.push(Delta::finished());
                }
                Signal::Failed(message) => {
                    tracing::warn!(error = %message, "upstream reported failure");
                    self.outcome = Outcome::Failed;
                    deltas.push(Delta::failed(message));
                }
            }
        }
        deltas
    }

    /// The source ended. Closes the stream if no terminal event arrived.
    pub fn finish(&mut self) -> Option<Delta> {
        if self.is_finished() {
            return None;
        }
        tracing::debug!("upstream ended without a terminal event, treating as complete");
        self.outcome = Outcome::Completed;
        Some(Delta::finished())
    }

    /// Terminate the stream from outside (timeout, transport failure).
    pub fn fail(&mut self, message: impl Into<String>) -> Option<Delta> {
        if self.is_finished() {
            return None;
        }
        self.outcome = Outcome::Failed;
        Some(Delta::failed(message))
    }

    pub fn is_finished(&self) -> bool {
        self.outcome != Outcome::Open
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Last linkage identifier seen in this stream.
    pub fn linkage(&self) -> Option<&str> {
        self.linkage.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}
