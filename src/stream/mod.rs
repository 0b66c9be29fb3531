//! Realtime stream modules.
//!
//! - `client`: connection lifecycle, handshake retries, and the decode task.
//! - `sse`: `text/event-stream` framing for incoming push events.

/// Stream connection and its error type.
pub mod client;
/// Server-sent event decoding.
pub mod sse;
