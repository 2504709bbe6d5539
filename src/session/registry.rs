//! Time-bounded registry of upstream conversation sessions.
//!
//! Two DashMaps keyed by conversation key:
//! - `sessions` holds the linkage state for each conversation
//! - `turns` holds one async mutex per key; holding it means a turn is in
//!   flight for that conversation
//!
//! The sweep never evicts a key whose turn lock is held, so eviction cannot
//! race a running `resolve`/`advance` for the same conversation.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Source of "now" for session timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(delta) = chrono::Duration::from_std(by) {
            let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
            *now = *now + delta;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Upstream linkage state for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSession {
    pub key: String,
    /// Upstream chat/session identifier.
    pub chat_id: String,
    /// Message the next turn continues from. `None` means a new conversation.
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Completed turns.
    pub turns: u64,
}

/// Holding this means a turn is in flight for `key`.
#[derive(Debug)]
pub struct TurnGuard {
    key: String,
    _lock: OwnedMutexGuard<()>,
}

impl TurnGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Concurrent session registry with TTL eviction.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, ConversationSession>,
    turns: DashMap<String, Arc<AsyncMutex<()>>>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
}

impl SessionRegistry {
    pub fn new(max_age: Duration) -> Self {
        Self::with_clock(max_age, Arc::new(SystemClock))
    }

    pub fn with_clock(max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            turns: DashMap::new(),
            clock,
            max_age,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Look up a session and refresh its last-access time.
    pub fn get(&self, key: &str) -> Option<ConversationSession> {
        let now = self.clock.now();
        let mut entry = self.sessions.get_mut(key)?;
        entry.last_access = now;
        Some(entry.clone())
    }

    /// Return the session for `key`, creating it with `chat_id` if absent.
    ///
    /// An existing session wins; `chat_id` is only used on insert.
    pub fn get_or_insert(&self, key: &str, chat_id: String) -> ConversationSession {
        let now = self.clock.now();
        let mut entry = self
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| ConversationSession {
                key: key.to_string(),
                chat_id,
                parent_id: None,
                created_at: now,
                last_access: now,
                turns: 0,
            });
        entry.last_access = now;
        entry.clone()
    }

    /// Mutate a session in place. Returns the updated copy, or `None` when
    /// the key is absent.
    pub fn update<F>(&self, key: &str, f: F) -> Option<ConversationSession>
    where
        F: FnOnce(&mut ConversationSession),
    {
        let now = self.clock.now();
        let mut entry = self.sessions.get_mut(key)?;
        f(&mut entry);
        entry.last_access = now;
        Some(entry.clone())
    }

    pub fn remove(&self, key: &str) -> Option<ConversationSession> {
        self.sessions.remove(key).map(|(_, session)| session)
    }

    /// Move the session stored under `from` to `to`, replacing whatever
    /// `to` held. Refused while a turn is in flight for `to`.
    pub fn rekey(&self, from: &str, to: &str) -> bool {
        if from == to || self.is_busy(to) {
            return false;
        }
        let Some((_, mut session)) = self.sessions.remove(from) else {
            return false;
        };
        session.key = to.to_string();
        session.last_access = self.clock.now();
        self.sessions.insert(to.to_string(), session);
        true
    }

    fn turn_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.turns
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Claim the turn lock for `key` without waiting.
    pub fn try_begin_turn(&self, key: &str) -> Option<TurnGuard> {
        // Entry ref is released by turn_lock before locking.
        let lock = self.turn_lock(key);
        let guard = lock.try_lock_owned().ok()?;
        Some(TurnGuard {
            key: key.to_string(),
            _lock: guard,
        })
    }

    /// Wait for the turn lock for `key`.
    pub async fn begin_turn(&self, key: &str) -> TurnGuard {
        let lock = self.turn_lock(key);
        TurnGuard {
            key: key.to_string(),
            _lock: lock.lock_owned().await,
        }
    }

    /// Whether a turn is currently in flight for `key`.
    pub fn is_busy(&self, key: &str) -> bool {
        self.turns
            .get(key)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Evict sessions idle for longer than the max age. Returns how many
    /// were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let busy: HashSet<String> = self
            .turns
            .iter()
            .filter(|entry| entry.value().try_lock().is_err())
            .map(|entry| entry.key().clone())
            .collect();

        let before = self.sessions.len();
        self.sessions.retain(|key, session| {
            if busy.contains(key) {
                return true;
            }
            let expired = (now - session.last_access)
                .to_std()
                .is_ok_and(|age| age > self.max_age);
            if expired {
                tracing::debug!(key = %key, turns = session.turns, "evicting idle session");
            }
            !expired
        });

        // Locks nobody holds or waits on can go; they are recreated on demand.
        self.turns
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());

        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copy of every session, sorted by key.
    pub fn snapshot(&self) -> Vec<ConversationSession> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    /// Run [`sweep`](Self::sweep) every `period` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let evicted = self.sweep();
                if evicted > 0 {
                    tracing::info!(evicted, remaining = self.len(), "session sweep");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn registry() -> (SessionRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (SessionRegistry::with_clock(HOUR, clock.clone()), clock)
    }

    #[test]
    fn get_or_insert_keeps_first_chat_id() {
        let (registry, _) = registry();
        let first = registry.get_or_insert("k", "chat-1".to_string());
        let second = registry.get_or_insert("k", "chat-2".to_string());
        assert_eq!(first.chat_id, "chat-1");
        assert_eq!(second.chat_id, "chat-1");
        assert_eq!(second.parent_id, None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_refreshes_last_access() {
        let (registry, clock) = registry();
        let created = registry.get_or_insert("k", "c".to_string());
        clock.advance(Duration::from_secs(60));
        let seen = registry.get("k").unwrap();
        assert_eq!(seen.created_at, created.created_at);
        assert_eq!(
            (seen.last_access - created.last_access).num_seconds(),
            60
        );
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn update_missing_key_is_none() {
        let (registry, _) = registry();
        assert!(registry.update("nope", |s| s.turns += 1).is_none());
    }

    #[test]
    fn sweep_evicts_only_idle_sessions() {
        let (registry, clock) = registry();
        registry.get_or_insert("stale", "c1".to_string());
        registry.get_or_insert("fresh", "c2".to_string());

        clock.advance(Duration::from_secs(3599));
        registry.get("fresh");
        clock.advance(Duration::from_secs(2));

        assert_eq!(registry.sweep(), 1);
        assert!(registry.get("stale").is_none());
        assert!(registry.get("fresh").is_some());
    }

    #[test]
    fn sweep_skips_sessions_with_turn_in_flight() {
        let (registry, clock) = registry();
        registry.get_or_insert("busy", "c".to_string());
        let guard = registry.try_begin_turn("busy").unwrap();

        clock.advance(HOUR * 2);
        assert_eq!(registry.sweep(), 0);
        assert!(registry.is_busy("busy"));

        drop(guard);
        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn evicted_key_starts_over() {
        let (registry, clock) = registry();
        registry.get_or_insert("k", "old".to_string());
        registry.update("k", |s| s.parent_id = Some("7".to_string()));
        clock.advance(HOUR * 2);
        registry.sweep();

        let fresh = registry.get_or_insert("k", "new".to_string());
        assert_eq!(fresh.chat_id, "new");
        assert_eq!(fresh.parent_id, None);
    }

    #[test]
    fn rekey_moves_session() {
        let (registry, _) = registry();
        registry.get_or_insert("old", "chat-1".to_string());
        registry.update("old", |s| s.parent_id = Some("2".to_string()));

        assert!(registry.rekey("old", "new"));
        assert!(registry.get("old").is_none());
        let moved = registry.get("new").unwrap();
        assert_eq!(moved.key, "new");
        assert_eq!(moved.chat_id, "chat-1");
        assert_eq!(moved.parent_id.as_deref(), Some("2"));

        assert!(!registry.rekey("missing", "other"));
        assert!(!registry.rekey("new", "new"));
    }

    #[test]
    fn rekey_refuses_busy_target() {
        let (registry, _) = registry();
        registry.get_or_insert("from", "chat-1".to_string());
        let _guard = registry.try_begin_turn("to").unwrap();
        assert!(!registry.rekey("from", "to"));
        assert!(registry.get("from").is_some());
    }

    #[test]
    fn turn_lock_is_exclusive_per_key() {
        let (registry, _) = registry();
        let first = registry.try_begin_turn("a").unwrap();
        assert_eq!(first.key(), "a");
        assert!(registry.try_begin_turn("a").is_none());
        assert!(registry.try_begin_turn("b").is_some());
        drop(first);
        assert!(registry.try_begin_turn("a").is_some());
    }

    #[tokio::test]
    async fn begin_turn_waits_for_release() {
        let registry = Arc::new(SessionRegistry::new(HOUR));
        let held = registry.try_begin_turn("k").unwrap();

        let mut waiter = tokio_test::task::spawn({
            let registry = registry.clone();
            async move { registry.begin_turn("k").await }
        });
        assert!(waiter.poll().is_pending());

        drop(held);
        assert!(waiter.is_woken());
        assert!(waiter.poll().is_ready());
    }

    #[test]
    fn sweep_drops_unused_turn_locks() {
        let (registry, _) = registry();
        drop(registry.try_begin_turn("k"));
        assert_eq!(registry.turns.len(), 1);
        registry.sweep();
        assert_eq!(registry.turns.len(), 0);
    }

    #[test]
    fn snapshot_sorted_by_key() {
        let (registry, _) = registry();
        registry.get_or_insert("b", "2".to_string());
        registry.get_or_insert("a", "1".to_string());
        let keys: Vec<_> = registry.snapshot().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_period() {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(SessionRegistry::with_clock(HOUR, clock.clone()));
        registry.get_or_insert("k", "c".to_string());
        clock.advance(HOUR * 2);

        let handle = registry.clone().spawn_sweeper(Duration::from_secs(1800));
        tokio::time::sleep(Duration::from_secs(1801)).await;
        assert!(registry.is_empty());
        handle.abort();
    }
}
