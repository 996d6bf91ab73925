//! A connection session with bounded reconnect.
//!
//! The session opens a connection through any [`Transport`], retrying with a
//! fixed backoff up to a configured number of attempts. Once the attempts
//! are spent the status stays [`ConnectionStatus::Disconnected`] and sends
//! fail fast instead of queueing.

use std::sync::Arc;
use std::time::Duration;

use stepwise_config::TransportConfig;
use stepwise_core::error::{ProtocolError, TransportError};
use stepwise_core::protocol::{ClientFrame, ServerFrame};
use stepwise_core::transport::Transport;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// How many times to try connecting, and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
        }
    }
}

impl From<&TransportConfig> for ReconnectPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts.max(1),
            backoff: config.reconnect_backoff(),
        }
    }
}

pub struct Session {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    outbound: Option<mpsc::Sender<ClientFrame>>,
    inbound: Option<mpsc::Receiver<Result<ServerFrame, ProtocolError>>>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            outbound: None,
            inbound: None,
        }
    }

    /// Connected only while both directions are open. A peer hang-up closes
    /// the inbound side first, even if the outbound side still accepts frames.
    pub fn status(&self) -> ConnectionStatus {
        match (&self.outbound, &self.inbound) {
            (Some(tx), Some(rx)) if !tx.is_closed() && !rx.is_closed() => {
                ConnectionStatus::Connected
            }
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Open a connection unless one is already live.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        self.close();

        let endpoint = self.transport.endpoint().to_string();
        for attempt in 1..=self.policy.max_attempts {
            info!(
                transport = self.transport.name(),
                endpoint = %endpoint,
                attempt,
                total = self.policy.max_attempts,
                "Connecting"
            );

            match self.transport.connect().await {
                Ok(conn) => {
                    self.outbound = Some(conn.outbound);
                    self.inbound = Some(conn.inbound);
                    return Ok(());
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, attempt, error = %e, "Connection attempt failed");
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }

        Err(TransportError::RetriesExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    /// A handle for sending frames without holding the session, used to
    /// cancel a generation while a step is waiting on the inbound side.
    pub fn sender(&self) -> Option<mpsc::Sender<ClientFrame>> {
        self.outbound.clone()
    }

    pub async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        let Some(tx) = self.outbound.as_ref().filter(|tx| !tx.is_closed()) else {
            self.close();
            return Err(TransportError::Disconnected);
        };
        debug!(frame_type = frame.frame_type(), "Queueing frame");
        if tx.send(frame).await.is_err() {
            self.close();
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    /// Next inbound frame. `None` means the connection is gone.
    ///
    /// `connection_established` frames are consumed here.
    pub async fn recv(&mut self) -> Option<Result<ServerFrame, ProtocolError>> {
        loop {
            let inbound = self.inbound.as_mut()?;
            match inbound.recv().await {
                Some(Ok(ServerFrame::ConnectionEstablished { message })) => {
                    debug!(message = ?message, "Connection established");
                }
                Some(frame) => return Some(frame),
                None => {
                    warn!("Connection lost");
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Drop any frames already buffered from a previous request.
    pub fn drain(&mut self) -> usize {
        let Some(inbound) = self.inbound.as_mut() else {
            return 0;
        };
        let mut dropped = 0;
        while let Ok(frame) = inbound.try_recv() {
            if !matches!(frame, Ok(ServerFrame::ConnectionEstablished { .. })) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "Discarded stale frames");
        }
        dropped
    }

    pub fn close(&mut self) {
        self.outbound = None;
        self.inbound = None;
    }
}
