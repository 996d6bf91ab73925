//! Transports and connection sessions for Stepwise.
//!
//! - [`WsTransport`] speaks the JSON frame protocol over a WebSocket.
//! - [`ScriptedTransport`] answers each request from an in-memory script,
//!   for tests and offline runs.
//! - [`Session`] owns one live connection and re-establishes it with a
//!   bounded, fixed-backoff retry policy.

pub mod scripted;
pub mod session;
pub mod websocket;

pub use scripted::{ScriptedReply, ScriptedTransport};
pub use session::{ConnectionStatus, ReconnectPolicy, Session};
pub use websocket::WsTransport;
