//! Conversation state manager.
//!
//! Decides which upstream conversation a request belongs to, serializes
//! turns per conversation and advances the parent-message linkage after
//! each completed turn. All session mutation goes through the
//! [`SessionRegistry`].

use std::sync::Arc;

use uuid::Uuid;

use super::registry::{ConversationSession, SessionRegistry, TurnGuard};
use crate::config::{ConflictPolicy, NewChatRule, ProviderConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::proxy::types::{ChatCompletionRequest, Message};
use crate::upstream::ConversationBootstrap;

/// Request header carrying an explicit conversation key.
pub const SESSION_HEADER: &str = "x-session-id";

const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_8b3d_4c57_9e21_d0a7_53b8_f914);

/// External conversation key and where it came from.
///
/// A derived key names the history a request continues: every message
/// before its newest user message. An opening request has no such history
/// and gets a fresh key. After each completed turn the session moves to
/// [`ConversationKey::successor`], the key the follow-up request derives
/// once the reply is part of its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationKey {
    pub value: String,
    /// Supplied by the caller rather than derived from the history.
    pub explicit: bool,
    /// Transcript of the whole request, for derived keys.
    transcript: Option<String>,
}

impl ConversationKey {
    /// Use the caller's key when given, otherwise derive one from the
    /// provider and the message history.
    pub fn for_request(
        provider: &str,
        explicit: Option<&str>,
        request: &ChatCompletionRequest,
    ) -> Self {
        if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
            return Self {
                value: key.to_string(),
                explicit: true,
                transcript: None,
            };
        }

        let messages = &request.messages;
        let cut = messages
            .iter()
            .rposition(|m| m.role == "user")
            .unwrap_or(messages.len());
        let prior = &messages[..cut];

        let value = if prior.iter().any(|m| m.role == "user") {
            digest(&transcript(provider, prior))
        } else {
            format!("conv-{}", Uuid::new_v4())
        };
        Self {
            value,
            explicit: false,
            transcript: Some(transcript(provider, messages)),
        }
    }

    /// Key of the follow-up request once `reply` is part of the history.
    /// Explicit keys never move.
    pub fn successor(&self, reply: &str) -> Option<String> {
        self.transcript.as_ref().map(|transcript| {
            let mut seed = transcript.clone();
            push_turn(&mut seed, "assistant", reply);
            digest(&seed)
        })
    }
}

fn transcript(provider: &str, messages: &[Message]) -> String {
    let mut seed = provider.to_string();
    for message in messages {
        push_turn(&mut seed, &message.role, &message.text());
    }
    seed
}

/// Append one turn. Assistant text is compared without its thinking
/// segment, since callers may strip it before sending the history back.
fn push_turn(seed: &mut String, role: &str, text: &str) {
    let text = match role {
        "assistant" => text.rsplit_once("</thinking>").map_or(text, |(_, answer)| answer),
        _ => text,
    };
    seed.push('\u{0}');
    seed.push_str(role);
    seed.push('\u{0}');
    seed.push_str(text.trim());
}

fn digest(seed: &str) -> String {
    format!("conv-{}", Uuid::new_v5(&KEY_NAMESPACE, seed.as_bytes()))
}

/// Everything the upstream request builder needs for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPlan {
    pub key: String,
    pub chat_id: String,
    /// `None` on the first turn of an upstream conversation.
    pub parent_id: Option<String>,
    /// Text to submit upstream.
    pub prompt: String,
    pub new_chat: bool,
}

pub struct ConversationManager {
    registry: Arc<SessionRegistry>,
    new_chat: NewChatRule,
    on_conflict: ConflictPolicy,
}

impl ConversationManager {
    pub fn new(registry: Arc<SessionRegistry>, config: &SessionConfig) -> Self {
        Self {
            registry,
            new_chat: config.new_chat,
            on_conflict: config.on_conflict,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Take the turn lock for `key` according to the conflict policy.
    pub async fn begin(&self, key: &str) -> Result<TurnGuard> {
        match self.on_conflict {
            ConflictPolicy::Reject => {
                self.registry
                    .try_begin_turn(key)
                    .ok_or_else(|| Error::SessionConflict {
                        key: key.to_string(),
                    })
            }
            ConflictPolicy::Queue => {
                if self.registry.is_busy(key) {
                    tracing::debug!(key = %key, "waiting for in-flight turn");
                }
                Ok(self.registry.begin_turn(key).await)
            }
        }
    }

    /// Look up the session for `key`, opening an upstream conversation when
    /// there is none.
    pub async fn resolve(
        &self,
        key: &str,
        bootstrap: &dyn ConversationBootstrap,
    ) -> Result<ConversationSession> {
        if let Some(session) = self.registry.get(key) {
            return Ok(session);
        }
        let chat_id = bootstrap.create_conversation().await?;
        tracing::debug!(key = %key, chat_id = %chat_id, "opened upstream conversation");
        Ok(self.registry.get_or_insert(key, chat_id))
    }

    /// Move the conversation's parent pointer to `parent_id`. Repeating the
    /// same id is a no-op.
    pub fn advance(&self, key: &str, parent_id: &str) -> Option<ConversationSession> {
        self.registry.update(key, |session| {
            if session.parent_id.as_deref() != Some(parent_id) {
                session.parent_id = Some(parent_id.to_string());
                session.turns += 1;
            }
        })
    }

    /// Record a completed turn. Providers without message linkage only bump
    /// the turn counter. A derived session then moves to the key its
    /// follow-up request will carry.
    pub fn complete_turn(&self, key: &ConversationKey, linkage: Option<&str>, reply: &str) {
        match linkage {
            Some(id) => {
                self.advance(&key.value, id);
            }
            None => {
                self.registry.update(&key.value, |session| session.turns += 1);
            }
        }
        if let Some(next) = key.successor(reply) {
            if self.registry.rekey(&key.value, &next) {
                tracing::debug!(from = %key.value, to = %next, "conversation re-keyed");
            }
        }
    }

    pub fn reset(&self, key: &str) -> Option<ConversationSession> {
        self.registry.remove(key)
    }

    /// Resolve the session for a turn and shape the prompt to send.
    ///
    /// Must be called while holding the turn lock for `key`.
    pub async fn prepare_turn(
        &self,
        key: &ConversationKey,
        provider: &ProviderConfig,
        request: &ChatCompletionRequest,
        bootstrap: &dyn ConversationBootstrap,
    ) -> Result<TurnPlan> {
        let last = request
            .last_user_message()
            .ok_or_else(|| Error::BadRequest("messages must contain a user message".to_string()))?;

        let restart = match self.new_chat {
            NewChatRule::FirstMessage => request.user_turns() == 1,
            NewChatRule::MissingSession => false,
        };
        if restart && self.reset(&key.value).is_some() {
            tracing::debug!(key = %key.value, "first message, starting a fresh conversation");
        }

        let session = self.resolve(&key.value, bootstrap).await?;
        let new_chat = session.parent_id.is_none() && session.turns == 0;
        let prompt = if new_chat && provider.kind.is_linked() && request.messages.len() > 1 {
            flatten_history(request)
        } else {
            last.text()
        };

        Ok(TurnPlan {
            key: key.value.clone(),
            chat_id: session.chat_id,
            parent_id: session.parent_id,
            prompt,
            new_chat,
        })
    }
}

/// Whole history as one prompt, for a fresh upstream conversation that
/// has to carry earlier context.
fn flatten_history(request: &ChatCompletionRequest) -> String {
    request
        .messages
        .iter()
        .map(|m| format!("{}: {}", title_case(&m.role), m.text()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn title_case(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::proxy::types::Message;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBootstrap(AtomicUsize);

    impl ConversationBootstrap for CountingBootstrap {
        fn create_conversation(&self) -> BoxFuture<'_, Result<String>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move { Ok(format!("chat-{}", n)) })
        }
    }

    struct FailingBootstrap;

    impl ConversationBootstrap for FailingBootstrap {
        fn create_conversation(&self) -> BoxFuture<'_, Result<String>> {
            Box::pin(async { Err(Error::Provider("create failed".to_string())) })
        }
    }

    fn manager(new_chat: NewChatRule, on_conflict: ConflictPolicy) -> ConversationManager {
        let config = SessionConfig {
            new_chat,
            on_conflict,
            ..SessionConfig::default()
        };
        ConversationManager::new(
            Arc::new(SessionRegistry::new(Duration::from_secs(3600))),
            &config,
        )
    }

    fn provider(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            name: "ds".to_string(),
            kind,
            transport: Default::default(),
            url: "http://localhost".to_string(),
            api_key: None,
            models: vec!["deepseek-chat".to_string()],
            headers: Default::default(),
            create_session_path: None,
            session_id_pointer: None,
            capture_url: None,
            thinking: false,
        }
    }

    fn request(messages: &[(&str, &str)]) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "deepseek-chat".to_string(),
            messages: messages.iter().map(|(r, c)| Message::new(*r, *c)).collect(),
            stream: Some(true),
            temperature: None,
            max_tokens: None,
            top_p: None,
            user: None,
        }
    }

    fn explicit(key: &str) -> ConversationKey {
        ConversationKey::for_request("ds", Some(key), &request(&[("user", "hi")]))
    }

    #[test]
    fn opening_requests_get_distinct_keys() {
        let first = request(&[("system", "be brief"), ("user", "hi")]);
        let a = ConversationKey::for_request("ds", None, &first);
        let b = ConversationKey::for_request("ds", None, &first);
        assert_ne!(a.value, b.value);
        assert!(a.value.starts_with("conv-"));
        assert!(!a.explicit);
    }

    #[test]
    fn follow_up_key_matches_successor() {
        let first = request(&[("system", "be brief"), ("user", "hi")]);
        let later = request(&[
            ("system", "be brief"),
            ("user", "hi"),
            ("assistant", " hello "),
            ("user", "how are you"),
        ]);
        let opening = ConversationKey::for_request("ds", None, &first);
        let follow_up = ConversationKey::for_request("ds", None, &later);
        assert_eq!(opening.successor("hello").as_deref(), Some(follow_up.value.as_str()));
        assert_ne!(opening.successor("hi there"), Some(follow_up.value.clone()));

        // The same history on another provider is another conversation.
        let other = ConversationKey::for_request("kimi", None, &later);
        assert_ne!(follow_up.value, other.value);
    }

    #[test]
    fn successor_ignores_thinking_segment() {
        let opening = ConversationKey::for_request("ds", None, &request(&[("user", "hi")]));
        let stripped = request(&[("user", "hi"), ("assistant", "hello!"), ("user", "next")]);
        let kept = request(&[
            ("user", "hi"),
            ("assistant", "<thinking>\nlet me think\n</thinking>\n\nhello!"),
            ("user", "next"),
        ]);
        let reply = "<thinking>\nlet me think\n</thinking>\n\nhello!";
        let next = opening.successor(reply).unwrap();
        assert_eq!(next, ConversationKey::for_request("ds", None, &stripped).value);
        assert_eq!(next, ConversationKey::for_request("ds", None, &kept).value);
    }

    #[test]
    fn explicit_key_wins() {
        let req = request(&[("user", "hi")]);
        let key = ConversationKey::for_request("ds", Some(" abc "), &req);
        assert_eq!(key.value, "abc");
        assert!(key.explicit);
        assert!(!ConversationKey::for_request("ds", Some(""), &req).explicit);
        assert_eq!(key.successor("anything"), None);
    }

    #[tokio::test]
    async fn resolve_is_idempotent_before_advance() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));

        let a = manager.resolve("k", &bootstrap).await.unwrap();
        let b = manager.resolve("k", &bootstrap).await.unwrap();
        assert_eq!(a.chat_id, b.chat_id);
        assert_eq!(bootstrap.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.parent_id, None);
    }

    #[tokio::test]
    async fn resolve_surfaces_bootstrap_failure() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let err = manager.resolve("k", &FailingBootstrap).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn advance_is_idempotent() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        manager.resolve("k", &bootstrap).await.unwrap();

        manager.advance("k", "42");
        let session = manager.advance("k", "42").unwrap();
        assert_eq!(session.parent_id.as_deref(), Some("42"));
        assert_eq!(session.turns, 1);

        let session = manager.advance("k", "43").unwrap();
        assert_eq!(session.parent_id.as_deref(), Some("43"));
        assert_eq!(session.turns, 2);
    }

    #[tokio::test]
    async fn complete_turn_without_linkage_counts_turns() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        manager.resolve("k", &bootstrap).await.unwrap();
        manager.complete_turn(&explicit("k"), None, "reply");
        let session = manager.registry().get("k").unwrap();
        assert_eq!(session.turns, 1);
        assert_eq!(session.parent_id, None);
    }

    #[tokio::test]
    async fn reject_policy_refuses_second_turn() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let _held = manager.begin("k").await.unwrap();
        let err = manager.begin("k").await.unwrap_err();
        assert!(matches!(err, Error::SessionConflict { .. }));
    }

    #[tokio::test]
    async fn queue_policy_waits_for_first_turn() {
        let manager = Arc::new(manager(NewChatRule::FirstMessage, ConflictPolicy::Queue));
        let held = manager.begin("k").await.unwrap();

        let mut second = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.begin("k").await.map(|g| g.key().to_string()) }
        });
        assert!(second.poll().is_pending());
        drop(held);
        match second.poll() {
            std::task::Poll::Ready(Ok(key)) => assert_eq!(key, "k"),
            other => panic!("expected the queued turn to start, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn continuing_turn_sends_last_message_with_parent() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        let provider = provider(ProviderKind::Deepseek);

        let first = request(&[("user", "hi")]);
        let key = ConversationKey::for_request("ds", None, &first);
        let plan = manager
            .prepare_turn(&key, &provider, &first, &bootstrap)
            .await
            .unwrap();
        assert!(plan.new_chat);
        assert_eq!(plan.prompt, "hi");
        assert_eq!(plan.parent_id, None);
        manager.complete_turn(&key, Some("2"), "hello");
        assert!(manager.registry().get(&key.value).is_none());

        let second = request(&[("user", "hi"), ("assistant", "hello"), ("user", "more")]);
        let key = ConversationKey::for_request("ds", None, &second);
        let plan = manager
            .prepare_turn(&key, &provider, &second, &bootstrap)
            .await
            .unwrap();
        assert!(!plan.new_chat);
        assert_eq!(plan.chat_id, "chat-1");
        assert_eq!(plan.parent_id.as_deref(), Some("2"));
        assert_eq!(plan.prompt, "more");
    }

    #[tokio::test]
    async fn first_message_rule_restarts_conversation() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        let provider = provider(ProviderKind::Deepseek);
        let req = request(&[("user", "hi")]);
        let key = explicit("k");

        manager.prepare_turn(&key, &provider, &req, &bootstrap).await.unwrap();
        manager.complete_turn(&key, Some("2"), "hello");
        let plan = manager.prepare_turn(&key, &provider, &req, &bootstrap).await.unwrap();
        assert_eq!(plan.chat_id, "chat-2");
        assert_eq!(plan.parent_id, None);
    }

    #[tokio::test]
    async fn missing_session_rule_keeps_conversation() {
        let manager = manager(NewChatRule::MissingSession, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        let provider = provider(ProviderKind::Deepseek);
        let req = request(&[("user", "hi")]);
        let key = explicit("k");

        manager.prepare_turn(&key, &provider, &req, &bootstrap).await.unwrap();
        manager.complete_turn(&key, Some("2"), "hello");
        let plan = manager.prepare_turn(&key, &provider, &req, &bootstrap).await.unwrap();
        assert_eq!(plan.chat_id, "chat-1");
        assert_eq!(plan.parent_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn new_conversation_flattens_history() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        let req = request(&[
            ("system", "be brief"),
            ("user", "hi"),
            ("assistant", "hello"),
            ("user", "again"),
        ]);
        let key = ConversationKey::for_request("ds", None, &req);
        let plan = manager
            .prepare_turn(&key, &provider(ProviderKind::Qwen), &req, &bootstrap)
            .await
            .unwrap();
        assert_eq!(
            plan.prompt,
            "System: be brief\n\nUser: hi\n\nAssistant: hello\n\nUser: again"
        );
    }

    #[tokio::test]
    async fn missing_user_message_is_bad_request() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        let req = request(&[("system", "only system")]);
        let key = ConversationKey::for_request("ds", None, &req);
        let err = manager
            .prepare_turn(&key, &provider(ProviderKind::Deepseek), &req, &bootstrap)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn two_clients_with_same_opening_stay_apart() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        let provider = provider(ProviderKind::Deepseek);
        let opening = request(&[("user", "hi")]);

        let a = ConversationKey::for_request("ds", None, &opening);
        let plan_a = manager.prepare_turn(&a, &provider, &opening, &bootstrap).await.unwrap();
        manager.complete_turn(&a, Some("A-reply-1"), "hello A");

        let b = ConversationKey::for_request("ds", None, &opening);
        let plan_b = manager.prepare_turn(&b, &provider, &opening, &bootstrap).await.unwrap();
        manager.complete_turn(&b, Some("B-reply-1"), "hello B");
        assert_ne!(plan_a.chat_id, plan_b.chat_id);

        let a2 = request(&[("user", "hi"), ("assistant", "hello A"), ("user", "continue A")]);
        let key = ConversationKey::for_request("ds", None, &a2);
        let plan = manager.prepare_turn(&key, &provider, &a2, &bootstrap).await.unwrap();
        assert_eq!(plan.chat_id, plan_a.chat_id);
        assert_eq!(plan.parent_id.as_deref(), Some("A-reply-1"));
        assert_eq!(plan.prompt, "continue A");

        let b2 = request(&[("user", "hi"), ("assistant", "hello B"), ("user", "continue B")]);
        let key = ConversationKey::for_request("ds", None, &b2);
        let plan = manager.prepare_turn(&key, &provider, &b2, &bootstrap).await.unwrap();
        assert_eq!(plan.chat_id, plan_b.chat_id);
        assert_eq!(plan.parent_id.as_deref(), Some("B-reply-1"));
    }

    #[tokio::test]
    async fn unknown_history_opens_new_conversation() {
        let manager = manager(NewChatRule::FirstMessage, ConflictPolicy::Reject);
        let bootstrap = CountingBootstrap(AtomicUsize::new(0));
        let provider = provider(ProviderKind::Deepseek);
        let opening = request(&[("user", "hi")]);

        let a = ConversationKey::for_request("ds", None, &opening);
        manager.prepare_turn(&a, &provider, &opening, &bootstrap).await.unwrap();
        manager.complete_turn(&a, Some("2"), "hello");

        // An edited assistant turn no longer matches any known history.
        let edited = request(&[("user", "hi"), ("assistant", "howdy"), ("user", "more")]);
        let key = ConversationKey::for_request("ds", None, &edited);
        let plan = manager.prepare_turn(&key, &provider, &edited, &bootstrap).await.unwrap();
        assert!(plan.new_chat);
        assert_eq!(plan.chat_id, "chat-2");
        assert_eq!(plan.prompt, "User: hi\n\nAssistant: howdy\n\nUser: more");
    }
}
