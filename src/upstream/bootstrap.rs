//! Opening a new upstream conversation.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::Value;

use super::http::authorize;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// Pointers tried, in order, when a provider has no `session_id_pointer`.
const DEFAULT_ID_POINTERS: &[&str] = &["/data/biz_data/id", "/data/id", "/id", "/chat_id"];

/// Creates the upstream chat a new conversation lives in.
pub trait ConversationBootstrap: Send + Sync {
    fn create_conversation(&self) -> BoxFuture<'_, Result<String>>;
}

/// Bootstrap driven by provider config.
///
/// With a `create_session_path` it POSTs to the provider and reads the id
/// from the response; without one the chat id is a local UUID. The whole
/// exchange is bounded by `wait`.
pub struct ProviderBootstrap<'a> {
    client: &'a Client,
    provider: &'a ProviderConfig,
    wait: Duration,
}

impl<'a> ProviderBootstrap<'a> {
    pub fn new(client: &'a Client, provider: &'a ProviderConfig, wait: Duration) -> Self {
        Self {
            client,
            provider,
            wait,
        }
    }

    async fn create(&self) -> Result<String> {
        let Some(path) = &self.provider.create_session_path else {
            return Ok(uuid::Uuid::new_v4().to_string());
        };

        tokio::time::timeout(self.wait, self.request(path))
            .await
            .map_err(|_| {
                tracing::warn!(provider = %self.provider.name, wait_secs = self.wait.as_secs(), "conversation bootstrap timed out");
                Error::Timeout(format!(
                    "'{}' did not create a conversation within {}s",
                    self.provider.name,
                    self.wait.as_secs()
                ))
            })?
    }

    async fn request(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.provider.url.trim_end_matches('/'), path);
        let builder = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(&serde_json::json!({}));
        let response = authorize(builder, self.provider).send().await.map_err(|e| {
            tracing::warn!(error = %e, provider = %self.provider.name, "conversation bootstrap failed");
            Error::Provider(format!(
                "Failed to create conversation on '{}': {}",
                self.provider.name, e
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, provider = %self.provider.name, "conversation bootstrap rejected");
            return Err(Error::Provider(format!(
                "Provider '{}' refused to create a conversation ({}): {}",
                self.provider.name, status, body
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            Error::Provider(format!(
                "Invalid conversation response from '{}': {}",
                self.provider.name, e
            ))
        })?;
        extract_id(&body, self.provider.session_id_pointer.as_deref()).ok_or_else(|| {
            Error::Provider(format!(
                "No conversation id in response from '{}'",
                self.provider.name
            ))
        })
    }
}

impl ConversationBootstrap for ProviderBootstrap<'_> {
    fn create_conversation(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(self.create())
    }
}

fn extract_id(body: &Value, pointer: Option<&str>) -> Option<String> {
    let candidates: Vec<&str> = match pointer {
        Some(p) => vec![p],
        None => DEFAULT_ID_POINTERS.to_vec(),
    };
    candidates
        .into_iter()
        .filter_map(|p| body.pointer(p))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
