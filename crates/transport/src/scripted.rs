//! In-process transport that replays scripted replies.
//!
//! Each `chat_start` received pops the next [`ScriptedReply`] and streams its
//! frames back. With an empty script the request is met with silence, which
//! is how step timeouts are exercised. Every outbound frame is recorded.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use stepwise_core::error::{ProtocolError, TransportError};
use stepwise_core::protocol::{ClientFrame, ServerFrame, ToolCallDescriptor};
use stepwise_core::transport::{Connection, Transport};
use tokio::sync::mpsc;
use tracing::debug;

/// What the scripted service does in answer to one `chat_start`.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream these frames (or decode failures) in order.
    Frames(Vec<Result<ServerFrame, ProtocolError>>),
    /// Say nothing.
    Silent,
    /// Drop the connection.
    Disconnect,
}

impl ScriptedReply {
    /// `chat_started`, one delta per chunk, then `chat_complete` with the joined text.
    pub fn completion(chunks: &[&str]) -> Self {
        let mut frames = vec![Ok(ServerFrame::ChatStarted { model: None })];
        frames.extend(chunks.iter().map(|c| {
            Ok(ServerFrame::ContentDelta {
                content: (*c).to_string(),
            })
        }));
        frames.push(Ok(ServerFrame::ChatComplete {
            content: chunks.concat(),
        }));
        Self::Frames(frames)
    }

    /// A completion that searched documentation once before answering.
    pub fn with_search(query: &str, results: usize, answer: &str) -> Self {
        let call = ToolCallDescriptor::new("search_docs", query).with_id("call_1");
        Self::Frames(vec![
            Ok(ServerFrame::ChatStarted { model: None }),
            Ok(ServerFrame::ToolCallStart {
                tool_calls: vec![call.clone()],
            }),
            Ok(ServerFrame::ToolCallComplete {
                tool_call: call,
                result: serde_json::Value::Array(vec![serde_json::Value::Null; results]),
            }),
            Ok(ServerFrame::ContentDelta {
                content: answer.to_string(),
            }),
            Ok(ServerFrame::ChatComplete {
                content: answer.to_string(),
            }),
        ])
    }

    /// `chat_started` followed by an upstream error.
    pub fn error(message: &str) -> Self {
        Self::Frames(vec![
            Ok(ServerFrame::ChatStarted { model: None }),
            Ok(ServerFrame::Error {
                error: message.to_string(),
            }),
        ])
    }

    /// Raw wire text, decoded the way a real transport would.
    pub fn raw(lines: &[&str]) -> Self {
        Self::Frames(lines.iter().map(|l| ServerFrame::parse(l)).collect())
    }
}

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<ScriptedReply>,
    sent: Vec<ClientFrame>,
    connects: u32,
    attempts: u32,
    failing_connects: u32,
}

/// A transport backed by a reply script. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transport that answers successive requests with `replies`.
    pub fn with_replies(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        let transport = Self::new();
        for reply in replies {
            transport.push(reply);
        }
        transport
    }

    /// Queue a reply for the next unanswered `chat_start`.
    pub fn push(&self, reply: ScriptedReply) {
        self.lock().replies.push_back(reply);
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Every frame the engine sent, in order.
    pub fn sent(&self) -> Vec<ClientFrame> {
        self.lock().sent.clone()
    }

    /// The `message` of every `chat_start` sent, in order.
    pub fn sent_messages(&self) -> Vec<String> {
        self.lock()
            .sent
            .iter()
            .filter_map(|f| match f {
                ClientFrame::ChatStart { message, .. } => Some(message.clone()),
                ClientFrame::StopGeneration {} => None,
            })
            .collect()
    }

    /// Successful connections opened so far.
    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    /// Connection attempts so far, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        // A poisoned script only means a test already panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn endpoint(&self) -> &str {
        "scripted://local"
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        {
            let mut state = self.lock();
            state.attempts += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::ConnectFailed {
                    endpoint: self.endpoint().to_string(),
                    reason: "connection refused".into(),
                });
            }
            state.connects += 1;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(64);
        let (in_tx, in_rx) = mpsc::channel(256);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let ready = ServerFrame::ConnectionEstablished {
                message: Some("scripted".into()),
            };
            if in_tx.send(Ok(ready)).await.is_err() {
                return;
            }

            while let Some(frame) = out_rx.recv().await {
                let reply = {
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    let is_request = matches!(frame, ClientFrame::ChatStart { .. });
                    state.sent.push(frame);
                    if is_request {
                        state.replies.pop_front().unwrap_or(ScriptedReply::Silent)
                    } else {
                        ScriptedReply::Silent
                    }
                };

                match reply {
                    ScriptedReply::Frames(frames) => {
                        for frame in frames {
                            if in_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    ScriptedReply::Silent => {}
                    ScriptedReply::Disconnect => {
                        debug!("Scripted transport dropping connection");
                        return;
                    }
                }
            }
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
