//! HTTP proxy server module.
//!
//! This module provides the OpenAI-compatible HTTP API that accepts chat
//! requests and bridges them onto the configured upstream providers.

mod handlers;
mod server;
pub mod types;

pub use handlers::{CHATBRIDGE_PROVIDER_HEADER, CHATBRIDGE_SESSION_HEADER};
pub use server::{create_router, run_server, serve, AppState, RequestId, REQUEST_ID_HEADER};
pub use types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Message};
