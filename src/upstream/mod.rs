//! Upstream event sources.
//!
//! Both transports end in a [`FrameStream`]: HTTP bodies via
//! [`http::open_turn`], page-rendered chats via [`BrowserPage::open_turn`].

pub mod bootstrap;
pub mod browser;
pub mod frame;
pub mod http;
pub mod request;

pub use bootstrap::{ConversationBootstrap, ProviderBootstrap};
pub use browser::{BrowserBinding, BrowserPage, NetworkEvent};
pub use frame::{FrameStream, RawFrame};
pub use request::UpstreamRequest;
