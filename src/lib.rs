//! chatbridge - one stable chat-completion API over heterogeneous web chat providers
//!
//! This library provides the core functionality for the chatbridge proxy:
//! configuration, provider selection, conversation tracking and the
//! translation of provider event streams into OpenAI-style chunks.

pub mod config;
pub mod error;
pub mod proxy;
pub mod router;
pub mod session;
pub mod translate;
pub mod upstream;

pub use config::Config;
pub use error::{Error, Result};
