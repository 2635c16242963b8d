//! Session Module - orchestration of a single voice call
//!
//! This module ties the signaling channel and the peer connection together:
//! - Call start, end and disposal
//! - Offer, answer and candidate exchange
//! - Cached audio settings
//! - State notifications for the embedding application

mod call_session;
mod endpoint;
mod error;
mod observer;
mod settings;

pub use call_session::CallSession;
pub use endpoint::channel_url;
pub use error::{CallError, ConfigurationError};
pub use observer::CallObserver;
pub use settings::CallSettings;
