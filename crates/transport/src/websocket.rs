//! WebSocket transport.
//!
//! One socket per connection. A writer task drains outbound frames onto the
//! socket; a reader task decodes text frames into [`ServerFrame`] values.
//! Ping/pong and binary frames are ignored. A close frame or socket error
//! ends the inbound channel, which the session reads as a disconnect, and
//! takes the writer down with it.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use stepwise_core::error::TransportError;
use stepwise_core::protocol::{ClientFrame, ServerFrame};
use stepwise_core::transport::{Connection, Transport};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

/// Channel depth for each direction.
const CHANNEL_CAPACITY: usize = 64;

/// A transport to a completion service at a `ws://` or `wss://` URL.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let (socket, _response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| TransportError::ConnectFailed {
                    endpoint: self.url.clone(),
                    reason: e.to_string(),
                })?;
        debug!(url = %self.url, "WebSocket connected");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        // Dropped by the reader on exit so the writer stops with it.
        let (reader_done, mut reader_gone) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = &mut reader_gone => {
                        debug!("Reader ended; closing writer");
                        break;
                    }
                };
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                debug!(frame_type = frame.frame_type(), "Sending frame");
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    warn!(error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let _reader_done = reader_done;
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => {
                        debug!("WebSocket closed by peer");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                };
                if in_tx.send(ServerFrame::parse(&text)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
