//! The task-execution engine.
//!
//! A task moves through **Plan → Execute → Evaluate** until it is judged
//! complete or a budget runs out:
//!
//! 1. **Plan**: the [`Planner`] turns the task into ordered steps, and
//!    [`structure_plan`] normalizes whatever came back
//! 2. **Execute**: the [`StepExecutor`] sends one step, the
//!    [`StreamRouter`] folds the streamed reply into the transcript, and any
//!    tool calls embedded in the reply are dispatched
//! 3. **Evaluate**: the [`Evaluator`] scores the result and decides whether
//!    to finish, proceed, or schedule a recovery step
//!
//! The [`Orchestrator`] owns the state machine that ties these together.

pub mod evaluator;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod router;
pub mod structure;

pub use evaluator::{Evaluator, LexicalEvaluator, TaskCategory};
pub use executor::{RunControl, StepExecutor, StepOutcome, StepReport, extract_tool_calls};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunOutcome, RunStatus};
pub use planner::{Planner, StaticPlanner, TransportPlanner, extract_plan_json};
pub use router::{RouteOutcome, StreamRouter};
pub use structure::structure_plan;

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use stepwise_core::error::ToolError;
    use stepwise_core::tool::{Tool, ToolResult};
    use stepwise_transport::{ReconnectPolicy, ScriptedTransport, Session};

    /// Records the `n` parameter of every call.
    pub struct CountingTool {
        name: String,
        calls: Arc<Mutex<Vec<i64>>>,
    }

    impl CountingTool {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                calls: Arc::default(),
            }
        }

        pub fn calls(&self) -> Arc<Mutex<Vec<i64>>> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "Counts calls"
        }

        async fn execute(&self, parameters: serde_json::Value) -> Result<ToolResult, ToolError> {
            let n = parameters["n"].as_i64().unwrap_or_default();
            self.calls.lock().unwrap().push(n);
            Ok(ToolResult::ok(format!("counted {n}")))
        }
    }

    pub async fn connected_session(transport: &ScriptedTransport) -> Session {
        let mut session = Session::new(Arc::new(transport.clone()), ReconnectPolicy::default());
        session.connect().await.unwrap();
        session
    }
}
