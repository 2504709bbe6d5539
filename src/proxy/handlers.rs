//! HTTP request handlers.

use axum::{
    body::Body,
    extract::{Extension, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;

use super::server::{AppState, RequestId};
use super::types::ChatCompletionRequest;
use crate::config::{ProviderConfig, Transport};
use crate::error::{Error, Result};
use crate::session::{ConversationKey, SESSION_HEADER};
use crate::translate::{collect_response, spawn_turn, OutwardChunk, TurnContext};
use crate::upstream::{http, request, BrowserPage, FrameStream, ProviderBootstrap, RawFrame};

/// Response header: conversation key the turn ran under.
pub const CHATBRIDGE_SESSION_HEADER: &str = "x-chatbridge-session";
/// Response header: provider name that handled the request.
pub const CHATBRIDGE_PROVIDER_HEADER: &str = "x-chatbridge-provider";

fn attach_chatbridge_headers(response: &mut Response, session: &str, provider: &str) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(session) {
        headers.insert(HeaderName::from_static(CHATBRIDGE_SESSION_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(provider) {
        headers.insert(HeaderName::from_static(CHATBRIDGE_PROVIDER_HEADER), value);
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    let is_streaming = request.is_streaming();
    tracing::info!(
        request_id = %request_id.0,
        model = %request.model,
        stream = is_streaming,
        messages = request.messages.len(),
        "Received chat completion request"
    );

    if request.messages.is_empty() {
        return Err(Error::BadRequest("messages must not be empty".to_string()));
    }

    let provider = state.router.select(&request.model)?;
    let page = browser_page(&state, &provider)?;

    let explicit = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let key = ConversationKey::for_request(&provider.name, explicit, &request);

    // Held until the turn task reports back.
    let guard = state.conversations.begin(&key.value).await?;
    // Bounds every upstream wait before the first frame.
    let wait = state.config.session.idle_timeout();
    let bootstrap = ProviderBootstrap::new(&state.http_client, &provider, wait);
    let plan = state
        .conversations
        .prepare_turn(&key, &provider, &request, &bootstrap)
        .await?;

    tracing::info!(
        request_id = %request_id.0,
        provider = %provider.name,
        session = %plan.key,
        new_chat = plan.new_chat,
        "Dispatching turn"
    );

    let frames = match page {
        Some(page) => page.open_turn(&plan.prompt, wait).await,
        None => {
            let upstream = request::build(&provider, &plan, &request);
            http::open_turn(&state.http_client, &provider, upstream, wait).await
        }
    };
    // From here on failures reach the caller in-band.
    let frames: FrameStream = frames.unwrap_or_else(|e| {
        futures::stream::once(async move { Err::<RawFrame, Error>(e) }).boxed()
    });

    let ctx = TurnContext {
        kind: provider.kind,
        model: request.model.clone(),
        thinking: state.config.server.thinking,
        idle_timeout: wait,
        max_turn: state.config.session.max_turn(),
    };
    let conversations = state.conversations.clone();
    let turn_key = key.clone();
    let chunks = spawn_turn(ctx, frames, move |report| {
        if report.completed() {
            conversations.complete_turn(&turn_key, report.linkage.as_deref(), &report.reply);
        } else {
            tracing::debug!(session = %turn_key.value, outcome = ?report.outcome, "turn not completed, linkage unchanged");
        }
        drop(guard);
    });

    let mut response = if is_streaming {
        let body = Body::from_stream(
            chunks.map(|chunk| chunk.to_sse().map_err(std::io::Error::other)),
        );
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response()
    } else {
        let collected: Vec<OutwardChunk> = chunks.collect().await;
        Json(collect_response(&collected, &request.model)).into_response()
    };

    attach_chatbridge_headers(&mut response, &plan.key, &provider.name);
    Ok(response)
}

fn browser_page(state: &AppState, provider: &ProviderConfig) -> Result<Option<Arc<BrowserPage>>> {
    match provider.transport {
        Transport::Http => Ok(None),
        Transport::Browser => state
            .browsers
            .get(&provider.name)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                Error::Browser(format!(
                    "No browser binding attached for provider '{}'",
                    provider.name
                ))
            }),
    }
}

/// Handle GET /v1/models - list available models across all providers
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models: Vec<serde_json::Value> = state
        .router
        .models()
        .into_iter()
        .map(|(model, provider)| {
            serde_json::json!({
                "id": model,
                "object": "model",
                "owned_by": provider.name,
            })
        })
        .collect();

    Json(serde_json::json!({
        "object": "list",
        "data": models
    }))
}

fn model_details(provider: &ProviderConfig) -> serde_json::Value {
    serde_json::json!({
        "format": "api",
        "family": provider.kind.as_str(),
        "families": [provider.kind.as_str()],
        "parameter_size": "",
        "quantization_level": "",
    })
}

/// Handle GET /api/tags - Ollama-style model listing
pub async fn ollama_tags(State(state): State<AppState>) -> impl IntoResponse {
    let modified_at = chrono::Utc::now().to_rfc3339();
    let models: Vec<serde_json::Value> = state
        .router
        .models()
        .into_iter()
        .map(|(model, provider)| {
            serde_json::json!({
                "name": model,
                "model": model,
                "modified_at": modified_at,
                "size": 0,
                "digest": "",
                "details": model_details(&provider),
            })
        })
        .collect();

    Json(serde_json::json!({ "models": models }))
}

#[derive(Debug, Deserialize)]
pub struct ShowRequest {
    #[serde(alias = "name")]
    pub model: String,
}

/// Handle POST /api/show - Ollama-style model metadata
pub async fn ollama_show(
    State(state): State<AppState>,
    Json(show): Json<ShowRequest>,
) -> Result<Json<serde_json::Value>> {
    let provider = state.router.select(&show.model)?;
    Ok(Json(serde_json::json!({
        "modelfile": "",
        "parameters": "",
        "template": "{{ .Prompt }}",
        "details": model_details(&provider),
        "model_info": {
            "general.architecture": provider.kind.as_str(),
            "general.basename": show.model,
        },
        "capabilities": ["completion"],
    })))
}

/// Handle DELETE /v1/sessions/:key - drop a conversation's upstream linkage
pub async fn reset_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode> {
    match state.conversations.reset(&key) {
        Some(session) => {
            tracing::info!(session = %key, turns = session.turns, "Session reset");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(Error::SessionNotFound { key }),
    }
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let providers: Vec<serde_json::Value> = state
        .router
        .providers()
        .iter()
        .map(|p| {
            let mut entry = serde_json::json!({
                "name": p.name,
                "kind": p.kind.as_str(),
                "transport": p.transport,
                "models": p.models,
            });
            if p.transport == Transport::Browser {
                entry["browser_attached"] = state.browsers.contains_key(&p.name).into();
            }
            entry
        })
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "service": "chatbridge",
        "sessions": state.conversations.registry().len(),
        "conversations": state.conversations.registry().snapshot(),
        "providers": providers,
    }))
}
