//! Router module for provider selection.
//!
//! Maps the requested model name onto a configured provider.

mod selector;

pub use selector::Router;
