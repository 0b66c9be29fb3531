//! Rust SDK for the Flowdock REST and streaming APIs.
//!
//! The crate is organized by transport surface:
//! - `api`: authenticated REST session for messages, comments, and invites.
//! - `stream`: live event stream for one or more flows.
//! - `events`: notification dispatcher both surfaces publish to.
//! - `auth`: credentials shared by the session and its streams.
//! - `retry`: bounded retry helper used by the stream handshake.

/// REST session, request payloads, and response types.
pub mod api;
/// Account credentials.
pub mod auth;
/// Crate-level error carried by `error` notifications.
pub mod error;
/// Notification types and the listener registry.
pub mod events;
/// Retry helpers.
pub mod retry;
/// Streaming connection and event decoding.
pub mod stream;

pub use api::{ApiError, ApiResponse, Session, SessionOptions};
pub use auth::Credentials;
pub use error::Error;
pub use events::{Dispatcher, ListenerId, Notification, NotificationKind};
pub use stream::client::{EventStream, StreamError, StreamOptions, StreamStatus};
