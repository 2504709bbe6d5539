//! HTTP transport: issue the turn request and expose the body as frames.

use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};

use super::frame::{sequence, FrameStream};
use super::request::UpstreamRequest;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// Attach the provider's credentials and extra headers.
pub fn authorize(mut builder: RequestBuilder, provider: &ProviderConfig) -> RequestBuilder {
    if let Some(api_key) = &provider.api_key {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", api_key.expose_secret()));
    }
    for (name, value) in &provider.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => tracing::warn!(provider = %provider.name, header = %name, "skipping invalid header"),
        }
    }
    builder
}

/// Send a turn request and return its body as a frame stream.
///
/// Connection failures and non-2xx statuses are returned as
/// [`Error::Provider`]; the body itself is not read here. Response headers
/// must arrive within `wait`, otherwise the request is dropped with
/// [`Error::Timeout`].
pub async fn open_turn(
    client: &Client,
    provider: &ProviderConfig,
    request: UpstreamRequest,
    wait: Duration,
) -> Result<FrameStream> {
    let url = request.url(&provider.url);
    let builder = client
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCEPT, "text/event-stream, application/json")
        .json(&request.body);

    let response = tokio::time::timeout(wait, authorize(builder, provider).send())
        .await
        .map_err(|_| {
            tracing::error!(provider = %provider.name, wait_secs = wait.as_secs(), "Provider sent no response");
            Error::Timeout(format!(
                "no response from '{}' within {}s",
                provider.name,
                wait.as_secs()
            ))
        })?
        .map_err(|e| {
            tracing::error!(error = %e, provider = %provider.name, "Failed to reach provider");
            Error::Provider(format!("Failed to reach provider '{}': {}", provider.name, e))
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = tokio::time::timeout(wait, response.text())
            .await
            .ok()
            .and_then(|text| text.ok())
            .unwrap_or_default();
        tracing::error!(
            status = %status,
            provider = %provider.name,
            body = %body,
            "Provider returned error"
        );
        return Err(Error::Provider(format!(
            "Provider '{}' returned {}: {}",
            provider.name, status, body
        )));
    }

    tracing::debug!(provider = %provider.name, url = %url, "upstream stream opened");
    Ok(sequence(
        format!("http:{}", provider.name),
        response.bytes_stream(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WAIT: Duration = Duration::from_secs(5);

    fn provider(url: String) -> ProviderConfig {
        ProviderConfig {
            name: "mock".to_string(),
            kind: ProviderKind::Openai,
            transport: Default::default(),
            url,
            api_key: Some("sk-test".into()),
            models: vec![],
            headers: [("x-extra".to_string(), "1".to_string())].into_iter().collect(),
            create_session_path: None,
            session_id_pointer: None,
            capture_url: None,
            thinking: false,
        }
    }

    #[tokio::test]
    async fn streams_body_with_auth_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("x-extra", "1"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string("data: [DONE]\n\n"))
            .mount(&server)
            .await;

        let request = UpstreamRequest {
            path: "/chat/completions".to_string(),
            body: json!({"stream": true}),
        };
        let frames = open_turn(&Client::new(), &provider(server.uri()), request, WAIT)
            .await
            .unwrap();
        let payload: Vec<u8> = frames
            .map(|f| f.unwrap().payload.to_vec())
            .concat()
            .await;
        assert_eq!(payload, b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn non_success_status_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let request = UpstreamRequest {
            path: "/chat/completions".to_string(),
            body: json!({}),
        };
        let err = match open_turn(&Client::new(), &provider(server.uri()), request, WAIT).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        let message = err.to_string();
        assert!(message.contains("401"), "{}", message);
        assert!(message.contains("bad token"), "{}", message);
    }

    #[tokio::test]
    async fn missing_response_headers_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let request = UpstreamRequest {
            path: "/chat/completions".to_string(),
            body: json!({}),
        };
        let started = std::time::Instant::now();
        let result = open_turn(
            &Client::new(),
            &provider(server.uri()),
            request,
            Duration::from_millis(300),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        match result {
            Err(Error::Timeout(message)) => assert!(message.contains("'mock'"), "{}", message),
            Err(other) => panic!("expected a timeout, got {:?}", other),
            Ok(_) => panic!("expected a timeout"),
        }
    }
}
