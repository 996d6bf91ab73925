//! # Stepwise Core
//!
//! Domain types, traits, and error definitions for the Stepwise
//! task-execution engine. This crate has **no transport or runtime
//! dependencies**; it defines the model that the other crates implement
//! against.
//!
//! ## Design Philosophy
//!
//! The seams of the engine are traits defined here:
//! - [`Transport`] — how frames reach the completion service
//! - [`Tool`] — a named, parameterized side-effecting action
//!
//! Everything else (plans, steps, agent state, evaluation results, the wire
//! protocol) is plain data with serde support, so it can be logged,
//! persisted, or replayed in tests without a live connection.

pub mod agent;
pub mod error;
pub mod event;
pub mod message;
pub mod plan;
pub mod protocol;
pub mod tool;
pub mod transport;

// Re-export key types at crate root for ergonomics
pub use agent::{
    AgentPhase, AgentState, EvaluationCriteria, EvaluationResult, NextAction, QualityLabel,
    Transition,
};
pub use error::{EngineError, Error, ProtocolError, Result, ToolError, TransportError};
pub use event::{EngineEvent, EventBus};
pub use message::{HistoryEntry, Message, MessageState, Role, Transcript};
pub use plan::{Plan, Step};
pub use protocol::{ClientFrame, ServerFrame, ToolCallDescriptor};
pub use tool::{Tool, ToolInvocation, ToolRegistry, ToolResult};
pub use transport::{Connection, Transport};
