//! Planners — produce a [`Plan`] for a task.
//!
//! [`TransportPlanner`] asks the completion service for a JSON plan and runs
//! the reply through [`structure_plan`]. [`StaticPlanner`] structures a fixed
//! response, for plan files and tests.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use stepwise_core::error::{EngineError, Result, TransportError};
use stepwise_core::plan::Plan;
use stepwise_core::protocol::{ClientFrame, ServerFrame};
use stepwise_transport::Session;
use tracing::{debug, info, warn};

use crate::structure::structure_plan;

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").expect("valid JSON object pattern"));

/// Trait for producing a plan from a task.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Plan `task`. Only transport failures are errors; an unusable reply
    /// still yields a plan.
    async fn plan(&self, task: &str, session: &mut Session) -> Result<Plan>;
}

/// Plans by asking the completion service.
pub struct TransportPlanner {
    model: String,
    timeout: Duration,
}

impl TransportPlanner {
    pub fn new(model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            model: model.into(),
            timeout,
        }
    }

    fn prompt(task: &str) -> String {
        format!(
            r#"Break the following task into an ordered plan.

Respond with JSON only, in this shape:
{{
  "steps": [
    {{ "id": "step_1", "description": "...", "requiredTools": [], "expectedOutcome": "..." }}
  ],
  "completionCriteria": ["..."],
  "estimatedIterations": 3
}}

Task: {task}"#
        )
    }

    /// Wait for the reply text. `None` means the service answered with an
    /// error or not at all.
    async fn await_reply(&self, session: &mut Session) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match tokio::time::timeout_at(deadline, session.recv()).await {
                Err(_) => {
                    warn!(
                        timeout_secs = self.timeout.as_secs(),
                        "Planning request timed out"
                    );
                    return Ok(None);
                }
                Ok(None) => return Err(TransportError::Disconnected.into()),
                Ok(Some(Err(e))) => warn!(error = %e, "Ignoring undecodable frame while planning"),
                Ok(Some(Ok(ServerFrame::ChatComplete { content }))) => return Ok(Some(content)),
                Ok(Some(Ok(ServerFrame::Error { error }))) => {
                    warn!(error = %error, "Completion service rejected planning request");
                    return Ok(None);
                }
                Ok(Some(Ok(frame))) => debug!(frame_type = frame.frame_type(), "Planning frame"),
            }
        }
    }
}

#[async_trait]
impl Planner for TransportPlanner {
    async fn plan(&self, task: &str, session: &mut Session) -> Result<Plan> {
        if !session.is_connected() {
            return Err(EngineError::NotConnected.into());
        }
        session.drain();
        session
            .send(ClientFrame::ChatStart {
                message: Self::prompt(task),
                model: self.model.clone(),
                conversation: Vec::new(),
            })
            .await?;

        let reply = self.await_reply(session).await?.unwrap_or_default();
        let raw = extract_plan_json(&reply);
        let plan = structure_plan(&raw, task);
        info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            estimated_iterations = plan.estimated_iterations,
            "Plan structured"
        );
        Ok(plan)
    }
}

/// Plans from a fixed raw response without touching the transport.
pub struct StaticPlanner {
    raw: Value,
}

impl StaticPlanner {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// A planner whose every plan is the single-step fallback.
    pub fn single_step() -> Self {
        Self::new(Value::Null)
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, task: &str, _session: &mut Session) -> Result<Plan> {
        Ok(structure_plan(&self.raw, task))
    }
}

/// Pull the first `{ ... }` block out of a reply and parse it.
///
/// Replies often wrap the JSON in prose or code fences. Anything that does
/// not parse becomes `null`, which structures to the single-step plan.
pub fn extract_plan_json(reply: &str) -> Value {
    JSON_OBJECT
        .find(reply)
        .and_then(|m| match serde_json::from_str(m.as_str()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Planning reply is not valid JSON");
                None
            }
        })
        .unwrap_or(Value::Null)
}
