//! Upstream request bodies, one shape per provider kind.

use serde_json::{json, Value};

use crate::config::{ProviderConfig, ProviderKind};
use crate::proxy::types::ChatCompletionRequest;
use crate::session::TurnPlan;

/// Path and JSON body of one upstream turn request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    /// Appended to the provider's base URL.
    pub path: String,
    pub body: Value,
}

impl UpstreamRequest {
    pub fn url(&self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.path)
    }
}

/// Build the turn request for `provider`.
///
/// OpenAI-compatible providers get the caller's full history; the web chat
/// providers get the shaped prompt plus their conversation linkage.
pub fn build(
    provider: &ProviderConfig,
    plan: &TurnPlan,
    request: &ChatCompletionRequest,
) -> UpstreamRequest {
    match provider.kind {
        ProviderKind::Openai => openai(request),
        ProviderKind::Deepseek => deepseek(provider, plan),
        ProviderKind::Kimi => kimi(plan),
        ProviderKind::Qwen => qwen(provider, plan, request),
        ProviderKind::Blob => blob(plan),
    }
}

fn openai(request: &ChatCompletionRequest) -> UpstreamRequest {
    let mut body = json!({
        "model": request.model,
        "messages": request.messages,
        "stream": true,
    });
    if let Some(obj) = body.as_object_mut() {
        if let Some(t) = request.temperature {
            obj.insert("temperature".to_string(), json!(t));
        }
        if let Some(m) = request.max_tokens {
            obj.insert("max_tokens".to_string(), json!(m));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".to_string(), json!(p));
        }
    }
    UpstreamRequest {
        path: "/chat/completions".to_string(),
        body,
    }
}

fn deepseek(provider: &ProviderConfig, plan: &TurnPlan) -> UpstreamRequest {
    // Message ids are integers upstream.
    let parent = plan.parent_id.as_deref().map(|id| match id.parse::<u64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    });
    UpstreamRequest {
        path: "/chat/completion".to_string(),
        body: json!({
            "chat_session_id": plan.chat_id,
            "parent_message_id": parent,
            "prompt": plan.prompt,
            "ref_file_ids": [],
            "thinking_enabled": provider.thinking,
            "search_enabled": false,
        }),
    }
}

fn kimi(plan: &TurnPlan) -> UpstreamRequest {
    UpstreamRequest {
        path: format!("/chat/{}/completion/stream", plan.chat_id),
        body: json!({
            "messages": [{"role": "user", "content": plan.prompt}],
            "refs": [],
            "use_search": false,
        }),
    }
}

fn qwen(provider: &ProviderConfig, plan: &TurnPlan, request: &ChatCompletionRequest) -> UpstreamRequest {
    UpstreamRequest {
        path: format!("/v2/chat/completions?chat_id={}", plan.chat_id),
        body: json!({
            "stream": true,
            "incremental_output": true,
            "chat_id": plan.chat_id,
            "chat_mode": "normal",
            "model": request.model,
            "parent_id": plan.parent_id,
            "messages": [{
                "role": "user",
                "content": plan.prompt,
                "chat_type": "t2t",
                "feature_config": {"thinking_enabled": provider.thinking},
            }],
        }),
    }
}

fn blob(plan: &TurnPlan) -> UpstreamRequest {
    UpstreamRequest {
        path: "/chat".to_string(),
        body: json!({
            "conversation_id": plan.chat_id,
            "parent_id": plan.parent_id,
            "prompt": plan.prompt,
        }),
    }
}
