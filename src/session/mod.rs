//! Conversation continuity.
//!
//! [`SessionRegistry`] owns the per-conversation linkage state and evicts it
//! after a TTL; [`ConversationManager`] decides, per request, which upstream
//! conversation to continue and serializes turns on it.

mod manager;
mod registry;

pub use manager::{ConversationKey, ConversationManager, TurnPlan, SESSION_HEADER};
pub use registry::{
    Clock, ConversationSession, ManualClock, SessionRegistry, SystemClock, TurnGuard,
};
