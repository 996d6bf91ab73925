//! Transport trait — the abstraction over the completion-service connection.
//!
//! A transport knows how to open one persistent, bidirectional connection
//! and expose it as a pair of channels. Framing and decoding happen inside
//! the transport so everything above it deals in [`ClientFrame`] and
//! [`ServerFrame`] values only.
//!
//! Implementations: WebSocket, in-process scripted transport.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ProtocolError, TransportError};
use crate::protocol::{ClientFrame, ServerFrame};

/// One open connection.
///
/// The connection is considered lost when `inbound` yields `None`.
pub struct Connection {
    /// Frames to send to the completion service.
    pub outbound: mpsc::Sender<ClientFrame>,

    /// Decoded frames (or decode failures) in arrival order.
    pub inbound: mpsc::Receiver<Result<ServerFrame, ProtocolError>>,
}

/// The core Transport trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// A human-readable name for this transport (e.g., "websocket").
    fn name(&self) -> &str;

    /// Where this transport connects to, for logs and errors.
    fn endpoint(&self) -> &str;

    /// Open a new connection.
    async fn connect(&self) -> Result<Connection, TransportError>;
}
