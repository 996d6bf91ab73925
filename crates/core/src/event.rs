//! Engine event system — decoupled observation of a running task.
//!
//! The orchestrator publishes an event whenever something an operator or
//! front end might care about happens. Subscribers filter for what they need.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::agent::{AgentPhase, NextAction};

/// All engine events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A task was accepted
    TaskStarted {
        task: String,
        timestamp: DateTime<Utc>,
    },

    /// The planner produced a plan
    PlanCreated {
        plan_id: String,
        steps: usize,
        estimated_iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// A step request was issued
    StepStarted {
        step_id: String,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool embedded in a step response was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The per-step tool-call cap dropped some calls
    ToolCallsTruncated {
        step_id: String,
        executed: usize,
        ignored: usize,
        timestamp: DateTime<Utc>,
    },

    /// A step resolved (possibly to a sentinel)
    StepFinished {
        step_id: String,
        degraded: bool,
        timestamp: DateTime<Utc>,
    },

    /// The evaluator scored a step result
    Evaluated {
        step_id: String,
        quality: f64,
        confidence: f64,
        is_complete: bool,
        next_action: Option<NextAction>,
        timestamp: DateTime<Utc>,
    },

    /// The state machine moved
    StateChanged {
        from: AgentPhase,
        to: AgentPhase,
        timestamp: DateTime<Utc>,
    },

    /// A task reached a terminal or paused state
    TaskFinished {
        phase: AgentPhase,
        iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for engine events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<EngineEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EngineEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
