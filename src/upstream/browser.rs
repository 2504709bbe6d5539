//! Browser transport.
//!
//! Some providers only render their chat in a logged-in browser page. The
//! embedding program attaches a [`BrowserBinding`] for such a provider; the
//! [`BrowserPage`] adapter submits the prompt through it and turns the
//! page's captured network traffic into the same ordered frame stream an
//! HTTP body produces.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use regex::Regex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::frame::{sequence, FrameStream};
use crate::error::{Error, Result};

/// Network activity reported by the browser instrumentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Response headers arrived for a request.
    Response {
        request_id: String,
        url: String,
        status: u16,
    },
    /// A chunk of a streamed response body.
    Data { request_id: String, data: Bytes },
    LoadingFinished { request_id: String },
    LoadingFailed { request_id: String, error: String },
}

/// Instrumentation channel for one browser page.
pub trait BrowserBinding: Send + Sync {
    /// Receive network events from now on.
    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent>;

    /// Full body of a finished response.
    fn response_body<'a>(&'a self, request_id: &'a str) -> BoxFuture<'a, Result<Bytes>>;

    /// Type `text` into the page's input and submit it.
    fn submit_prompt<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// A shared browser page serving one provider, one turn at a time.
pub struct BrowserPage {
    provider: String,
    binding: Arc<dyn BrowserBinding>,
    capture: Regex,
    page: Arc<Mutex<()>>,
}

impl BrowserPage {
    /// `capture` selects the request whose response carries the answer.
    pub fn new(provider: impl Into<String>, binding: Arc<dyn BrowserBinding>, capture: Regex) -> Self {
        Self {
            provider: provider.into(),
            binding,
            capture,
            page: Arc::new(Mutex::new(())),
        }
    }

    /// Submit `prompt` and stream the captured response.
    ///
    /// Waits for any turn already using the page. The page stays claimed
    /// until the returned stream is dropped. The page must take the prompt
    /// within `wait`.
    pub async fn open_turn(&self, prompt: &str, wait: Duration) -> Result<FrameStream> {
        let guard = self.page.clone().lock_owned().await;
        // Subscribe first so nothing between submit and capture is missed.
        let events = self.binding.subscribe();
        tokio::time::timeout(wait, self.binding.submit_prompt(prompt))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "browser page for '{}' did not take the prompt within {}s",
                    self.provider,
                    wait.as_secs()
                ))
            })??;
        tracing::debug!(provider = %self.provider, "prompt submitted to browser page");

        let capture = Capture {
            events,
            binding: self.binding.clone(),
            pattern: self.capture.clone(),
            request_id: None,
            streamed: false,
            done: false,
            _page: guard,
        };
        let chunks = futures::stream::unfold(capture, |mut capture| async move {
            let item = capture.next_chunk().await?;
            Some((item, capture))
        });
        Ok(sequence(format!("browser:{}", self.provider), chunks.boxed()))
    }
}

struct Capture {
    events: broadcast::Receiver<NetworkEvent>,
    binding: Arc<dyn BrowserBinding>,
    pattern: Regex,
    /// The matched request, once its response headers were seen.
    request_id: Option<String>,
    /// Body data already arrived through `Data` events.
    streamed: bool,
    done: bool,
    _page: OwnedMutexGuard<()>,
}

impl Capture {
    fn is_target(&self, id: &str) -> bool {
        self.request_id.as_deref() == Some(id)
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }
        loop {
            let event = match self.events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    self.done = true;
                    return Some(Err(Error::Browser(format!(
                        "browser event channel lagged, {} events lost",
                        skipped
                    ))));
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            };

            match event {
                NetworkEvent::Response {
                    request_id,
                    url,
                    status,
                } if self.request_id.is_none() && self.pattern.is_match(&url) => {
                    tracing::debug!(request_id = %request_id, url = %url, status, "captured response");
                    if !(200..300).contains(&status) {
                        self.done = true;
                        return Some(Err(Error::Browser(format!(
                            "captured request returned {}",
                            status
                        ))));
                    }
                    self.request_id = Some(request_id);
                }
                NetworkEvent::Data { request_id, data } if self.is_target(&request_id) => {
                    self.streamed = true;
                    return Some(Ok(data));
                }
                NetworkEvent::LoadingFinished { request_id } if self.is_target(&request_id) => {
                    self.done = true;
                    if self.streamed {
                        return None;
                    }
                    return Some(self.binding.response_body(&request_id).await);
                }
                NetworkEvent::LoadingFailed { request_id, error } if self.is_target(&request_id) => {
                    self.done = true;
                    return Some(Err(Error::Browser(error)));
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Replays a scripted event list when a prompt is submitted.
    struct ScriptedPage {
        tx: broadcast::Sender<NetworkEvent>,
        script: Vec<NetworkEvent>,
        bodies: Vec<(String, Bytes)>,
        prompts: StdMutex<Vec<String>>,
    }

    impl ScriptedPage {
        fn new(script: Vec<NetworkEvent>) -> Self {
            let (tx, _) = broadcast::channel(64);
            Self {
                tx,
                script,
                bodies: Vec::new(),
                prompts: StdMutex::new(Vec::new()),
            }
        }
    }

    impl BrowserBinding for ScriptedPage {
        fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
            self.tx.subscribe()
        }

        fn response_body<'a>(&'a self, request_id: &'a str) -> BoxFuture<'a, Result<Bytes>> {
            Box::pin(async move {
                self.bodies
                    .iter()
                    .find(|(id, _)| id == request_id)
                    .map(|(_, body)| body.clone())
                    .ok_or_else(|| Error::Browser("no body".to_string()))
            })
        }

        fn submit_prompt<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.prompts.lock().unwrap().push(text.to_string());
                for event in &self.script {
                    let _ = self.tx.send(event.clone());
                }
                Ok(())
            })
        }
    }

    fn response(id: &str, url: &str) -> NetworkEvent {
        NetworkEvent::Response {
            request_id: id.to_string(),
            url: url.to_string(),
            status: 200,
        }
    }

    fn data(id: &str, text: &'static str) -> NetworkEvent {
        NetworkEvent::Data {
            request_id: id.to_string(),
            data: Bytes::from_static(text.as_bytes()),
        }
    }

    fn finished(id: &str) -> NetworkEvent {
        NetworkEvent::LoadingFinished {
            request_id: id.to_string(),
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn page(binding: Arc<dyn BrowserBinding>) -> BrowserPage {
        BrowserPage::new("kimi-web", binding, Regex::new(r"/completion/stream$").unwrap())
    }

    async fn payloads(frames: FrameStream) -> Vec<Result<Bytes>> {
        frames.map(|f| f.map(|f| f.payload)).collect().await
    }

    #[tokio::test]
    async fn streams_only_the_captured_request() {
        let binding = Arc::new(ScriptedPage::new(vec![
            response("1", "https://kimi.example/api/user"),
            data("1", "noise"),
            response("2", "https://kimi.example/api/chat/abc/completion/stream"),
            data("2", "data: {\"event\":\"cmpl\",\"text\":\"hi\"}\n\n"),
            data("1", "more noise"),
            finished("1"),
            data("2", "data: {\"event\":\"all_done\"}\n\n"),
            finished("2"),
        ]));
        let page = page(binding.clone());
        let frames = page.open_turn("hello", WAIT).await.unwrap();
        let chunks = payloads(frames).await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.is_ok()));
        assert_eq!(binding.prompts.lock().unwrap().as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn fetches_body_when_nothing_streamed() {
        let mut script = ScriptedPage::new(vec![
            response("7", "https://x/completion/stream"),
            finished("7"),
        ]);
        script
            .bodies
            .push(("7".to_string(), Bytes::from_static(b"{\"content\":\"done\"}")));
        let frames = page(Arc::new(script)).open_turn("q", WAIT).await.unwrap();
        let chunks = payloads(frames).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), &Bytes::from_static(b"{\"content\":\"done\"}"));
    }

    #[tokio::test]
    async fn loading_failure_is_an_error_frame() {
        let binding = Arc::new(ScriptedPage::new(vec![
            response("3", "https://x/completion/stream"),
            NetworkEvent::LoadingFailed {
                request_id: "3".to_string(),
                error: "net::ERR_ABORTED".to_string(),
            },
        ]));
        let chunks = payloads(page(binding).open_turn("q", WAIT).await.unwrap()).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Err(Error::Browser(msg)) if msg.contains("ERR_ABORTED")));
    }

    #[tokio::test]
    async fn page_is_held_until_stream_dropped() {
        let binding = Arc::new(ScriptedPage::new(vec![]));
        let page = Arc::new(page(binding));

        let first = page.open_turn("one", WAIT).await.unwrap();
        let mut second = tokio_test::task::spawn({
            let page = page.clone();
            async move { page.open_turn("two", WAIT).await.map(|_| ()) }
        });
        assert!(second.poll().is_pending());

        drop(first);
        assert!(second.is_woken());
        assert!(matches!(second.poll(), std::task::Poll::Ready(Ok(()))));
    }

    struct StalledPage(broadcast::Sender<NetworkEvent>);

    impl BrowserBinding for StalledPage {
        fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
            self.0.subscribe()
        }

        fn response_body<'a>(&'a self, _request_id: &'a str) -> BoxFuture<'a, Result<Bytes>> {
            Box::pin(async { Ok(Bytes::new()) })
        }

        fn submit_prompt<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_submit_times_out_and_frees_page() {
        let (tx, _) = broadcast::channel(4);
        let page = page(Arc::new(StalledPage(tx)));

        let err = match page.open_turn("q", WAIT).await {
            Err(e) => e,
            Ok(_) => panic!("expected a timeout"),
        };
        assert!(matches!(&err, Error::Timeout(msg) if msg.contains("kimi-web")), "{:?}", err);
        assert!(page.page.try_lock().is_ok());
    }
}
