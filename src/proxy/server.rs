//! HTTP server setup and configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use regex::Regex;
use reqwest::Client;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::config::{Config, Transport};
use crate::error::{Error, Result};
use crate::router::Router as ProviderRouter;
use crate::session::{ConversationManager, SessionRegistry};
use crate::upstream::{BrowserBinding, BrowserPage};

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-chatbridge-request-id";

/// Correlation id assigned to every inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub uuid::Uuid);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub router: Arc<ProviderRouter>,
    pub http_client: Client,
    pub conversations: Arc<ConversationManager>,
    /// Browser pages by provider name.
    pub browsers: Arc<HashMap<String, Arc<BrowserPage>>>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(config.session.ttl()));
        Self::with_registry(config, registry)
    }

    /// State over an existing registry (e.g. one driven by a manual clock).
    pub fn with_registry(config: Config, registry: Arc<SessionRegistry>) -> Result<Self> {
        // Per-turn limits are enforced by the turn task, not the client.
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let conversations = ConversationManager::new(registry, &config.session);
        Ok(Self {
            router: Arc::new(ProviderRouter::new(config.providers.clone())),
            http_client,
            conversations: Arc::new(conversations),
            browsers: Arc::new(HashMap::new()),
            config: Arc::new(config),
        })
    }

    /// Attach the browser page serving a browser-transport provider.
    pub fn with_browser(mut self, provider: &str, binding: Arc<dyn BrowserBinding>) -> Result<Self> {
        let config = self
            .config
            .providers
            .iter()
            .find(|p| p.name == provider && p.transport == Transport::Browser)
            .ok_or_else(|| {
                Error::Browser(format!("'{}' is not a browser-transport provider", provider))
            })?;
        let pattern = config.capture_url.as_deref().unwrap_or_default();
        let capture = Regex::new(pattern)
            .map_err(|e| Error::Browser(format!("invalid capture_url for '{}': {}", provider, e)))?;

        Arc::make_mut(&mut self.browsers).insert(
            provider.to_string(),
            Arc::new(BrowserPage::new(provider, binding, capture)),
        );
        Ok(self)
    }
}

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId(uuid::Uuid::new_v4());
    request.extensions_mut().insert(id);
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let max_concurrent = state.config.server.max_concurrent_requests;
    Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        // Ollama-style metadata
        .route("/api/tags", get(handlers::ollama_tags))
        .route("/api/show", post(handlers::ollama_show))
        // chatbridge extensions
        .route("/v1/sessions/:key", delete(handlers::reset_session))
        .route("/health", get(handlers::health))
        // State and middleware
        .with_state(state)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    serve(AppState::new(config)?).await
}

/// Serve a prepared state, e.g. one with browser bindings attached.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen.clone();
    for provider in &state.config.providers {
        if provider.transport == Transport::Browser && !state.browsers.contains_key(&provider.name) {
            tracing::warn!(
                provider = %provider.name,
                "No browser binding attached; requests for this provider will fail"
            );
        }
    }

    let sweeper = state
        .conversations
        .registry()
        .clone()
        .spawn_sweeper(state.config.session.sweep_interval());

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting chatbridge server");

    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;

    Ok(())
}
