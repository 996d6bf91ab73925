//! Wire protocol between the engine and the completion service.
//!
//! Frames are JSON objects with a `type` discriminator over a persistent
//! connection. Outbound frames nest their payload under `data`; inbound
//! frames carry their payload at the top level (except `chat_started`,
//! which nests `{ "model" }` under `data`).
//!
//! Decoding happens once, at the transport boundary: an unknown `type` is a
//! [`ProtocolError::UnknownType`], never a silently ignored frame.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProtocolError;
use crate::message::HistoryEntry;

/// Frames sent by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Submit one task or step.
    ChatStart {
        message: String,
        model: String,
        #[serde(default)]
        conversation: Vec<HistoryEntry>,
    },
    /// Cancel the in-flight generation.
    StopGeneration {},
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::ChatStart { .. } => "chat_start",
            Self::StopGeneration {} => "stop_generation",
        }
    }
}

/// A tool call announced or completed by the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDescriptor {
    pub name: String,
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ToolCallDescriptor {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Frames received from the completion service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Transport ready.
    ConnectionEstablished { message: Option<String> },
    /// Request accepted.
    ChatStarted { model: Option<String> },
    /// Streamed text fragment.
    ContentDelta { content: String },
    /// The model invoked one or more tools.
    ToolCallStart { tool_calls: Vec<ToolCallDescriptor> },
    /// A tool result is available.
    ToolCallComplete {
        tool_call: ToolCallDescriptor,
        result: Value,
    },
    /// Final text for this request.
    ChatComplete { content: String },
    /// The request failed upstream.
    Error { error: String },
}

#[derive(Deserialize)]
struct ChatStartedData {
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompleteResult {
    #[serde(default)]
    content: String,
}

impl ServerFrame {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON frame.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                frame: "<untyped>".into(),
                field: "type".into(),
            })?
            .to_string();

        let field = |name: &str| -> Result<Value, ProtocolError> {
            value
                .get(name)
                .cloned()
                .ok_or_else(|| ProtocolError::MissingField {
                    frame: frame_type.clone(),
                    field: name.to_string(),
                })
        };
        let decode = |e: serde_json::Error| ProtocolError::InvalidJson(e.to_string());

        match frame_type.as_str() {
            "connection_established" => Ok(Self::ConnectionEstablished {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            "chat_started" => {
                let data = value.get("data").cloned().unwrap_or(Value::Null);
                let model = if data.is_null() {
                    None
                } else {
                    serde_json::from_value::<ChatStartedData>(data)
                        .map_err(decode)?
                        .model
                };
                Ok(Self::ChatStarted { model })
            }
            "content_delta" => {
                let content = serde_json::from_value(field("content")?).map_err(decode)?;
                Ok(Self::ContentDelta { content })
            }
            "tool_call_start" => {
                let tool_calls = serde_json::from_value(field("toolCalls")?).map_err(decode)?;
                Ok(Self::ToolCallStart { tool_calls })
            }
            "tool_call_complete" => {
                let tool_call = serde_json::from_value(field("toolCall")?).map_err(decode)?;
                let result = value.get("result").cloned().unwrap_or(Value::Null);
                Ok(Self::ToolCallComplete { tool_call, result })
            }
            "chat_complete" => {
                let result: ChatCompleteResult =
                    serde_json::from_value(field("result")?).map_err(decode)?;
                Ok(Self::ChatComplete {
                    content: result.content,
                })
            }
            "error" => {
                let error = match field("error")? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(Self::Error { error })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Encode to the wire shape accepted by [`ServerFrame::parse`].
    pub fn to_value(&self) -> Value {
        match self {
            Self::ConnectionEstablished { message } => {
                json!({ "type": "connection_established", "message": message })
            }
            Self::ChatStarted { model } => {
                json!({ "type": "chat_started", "data": { "model": model } })
            }
            Self::ContentDelta { content } => json!({ "type": "content_delta", "content": content }),
            Self::ToolCallStart { tool_calls } => {
                json!({ "type": "tool_call_start", "toolCalls": tool_calls })
            }
            Self::ToolCallComplete { tool_call, result } => {
                json!({ "type": "tool_call_complete", "toolCall": tool_call, "result": result })
            }
            Self::ChatComplete { content } => {
                json!({ "type": "chat_complete", "result": { "content": content } })
            }
            Self::Error { error } => json!({ "type": "error", "error": error }),
        }
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::ChatStarted { .. } => "chat_started",
            Self::ContentDelta { .. } => "content_delta",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallComplete { .. } => "tool_call_complete",
            Self::ChatComplete { .. } => "chat_complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Number of results a completed tool call reported.
///
/// Accepts a bare array, an object with a `results` array, or an object
/// with a numeric `count`.
pub fn result_count(result: &Value) -> usize {
    match result {
        Value::Array(items) => items.len(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("results") {
                items.len()
            } else {
                map.get("count").and_then(Value::as_u64).unwrap_or(0) as usize
            }
        }
        _ => 0,
    }
}
