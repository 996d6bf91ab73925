//! Error types for the Stepwise domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Stepwise operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Transport errors ---
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // --- Wire protocol errors ---
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Engine / orchestration errors ---
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Connection-level failures. Retried with bounded backoff by the session,
/// then surfaced as a disconnected status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// A frame that could not be decoded at the transport boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(String),

    #[error("Unknown message type: '{0}'")]
    UnknownType(String),

    #[error("Frame '{frame}' is missing field '{field}'")]
    MissingField { frame: String, field: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Malformed tool call: {0}")]
    MalformedCall(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },
}

/// Orchestration-level failures that reject or abort a `run_task` call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("A task is already running")]
    AlreadyRunning,

    #[error("Duplicate task submission rejected: {0}")]
    DuplicateTask(String),

    #[error("Task must not be empty")]
    EmptyTask,

    #[error("No plan to resume")]
    NoPlan,

    #[error("Not connected to the completion service")]
    NotConnected,

    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Invalid transition '{transition}' from state '{from}'")]
    InvalidTransition { from: String, transition: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_displays_correctly() {
        let err = Error::Transport(TransportError::RetriesExhausted { attempts: 3 });
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn protocol_error_names_unknown_type() {
        let err = Error::from(ProtocolError::UnknownType("video_chat_start".into()));
        assert!(err.to_string().contains("video_chat_start"));
    }

    #[test]
    fn engine_error_displays_transition() {
        let err = EngineError::InvalidTransition {
            from: "idle".into(),
            transition: "resume".into(),
        };
        assert!(err.to_string().contains("idle"));
        assert!(err.to_string().contains("resume"));
    }
}
