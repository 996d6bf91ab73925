//! The orchestrator owns the agent state machine and drives
//! Planner → Step Executor → Evaluator until the task completes, the plan or
//! iteration budget runs out, or an operator stops it.
//!
//! One task runs per orchestrator at a time. Steps never run concurrently.
//! Failures inside a step become step results; only a transport failure
//! while planning makes [`Orchestrator::run_task`] return an error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use stepwise_config::EngineConfig;
use stepwise_core::agent::{AgentPhase, AgentState, EvaluationCriteria, EvaluationResult, NextAction, Transition};
use stepwise_core::error::{EngineError, Error, Result, TransportError};
use stepwise_core::event::{EngineEvent, EventBus};
use stepwise_core::message::Message;
use stepwise_core::plan::{Plan, Step};
use stepwise_core::protocol::ClientFrame;
use stepwise_core::tool::ToolRegistry;
use stepwise_core::transport::Transport;
use stepwise_transport::{ReconnectPolicy, Session};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::evaluator::{Evaluator, LexicalEvaluator};
use crate::executor::{RunControl, StepExecutor, StepOutcome};
use crate::lock;
use crate::planner::{Planner, TransportPlanner};
use crate::router::StreamRouter;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Steps or iterations ran out before the task was judged complete.
    Partial,
    Paused,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub iterations: u32,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationResult>,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    planner: Option<Arc<dyn Planner>>,
    evaluator: Option<Arc<dyn Evaluator>>,
    tools: ToolRegistry,
    events: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    pub fn with_planner(mut self, planner: impl Planner + 'static) -> Self {
        let planner: Arc<dyn Planner> = Arc::new(planner);
        self.planner = Some(planner);
        self
    }

    pub fn with_evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        let evaluator: Arc<dyn Evaluator> = Arc::new(evaluator);
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let events = self.events.unwrap_or_default();
        let planner: Arc<dyn Planner> = match self.planner {
            Some(planner) => planner,
            None => Arc::new(TransportPlanner::new(
                config.model.clone(),
                config.executor.step_timeout(),
            )),
        };
        let evaluator: Arc<dyn Evaluator> = match self.evaluator {
            Some(evaluator) => evaluator,
            None => Arc::new(LexicalEvaluator::new()),
        };
        let executor = StepExecutor::from_config(&config, Arc::new(self.tools), Arc::clone(&events));
        let session = Session::new(self.transport, ReconnectPolicy::from(&config.transport));
        let (control, _) = watch::channel(RunControl::Run);

        Orchestrator {
            inner: Arc::new(Inner {
                criteria: config.evaluation.criteria(),
                state: Mutex::new(AgentState::new(config.max_iterations)),
                router: Mutex::new(StreamRouter::new(config.router.autonomous_prefix.clone())),
                session: tokio::sync::Mutex::new(session),
                canceller: Mutex::new(None),
                planner,
                evaluator,
                executor,
                events,
                control,
                processing: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                link_down: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                recoveries: AtomicUsize::new(0),
                config,
            }),
        }
    }
}

struct Inner {
    config: EngineConfig,
    criteria: EvaluationCriteria,
    state: Mutex<AgentState>,
    router: Mutex<StreamRouter>,
    session: tokio::sync::Mutex<Session>,
    /// Sends `stop_generation` without waiting for the session lock.
    canceller: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    planner: Arc<dyn Planner>,
    evaluator: Arc<dyn Evaluator>,
    executor: StepExecutor,
    events: Arc<EventBus>,
    control: watch::Sender<RunControl>,
    processing: AtomicBool,
    in_flight: Mutex<Option<String>>,
    /// Set once reconnect attempts are exhausted; cleared by `connect`.
    link_down: AtomicBool,
    /// Last observed session status, readable while a step holds the session.
    connected: AtomicBool,
    recoveries: AtomicUsize,
}

/// Releases the single-run guard when a run ends, however it ends.
struct ProcessingGuard<'a> {
    inner: &'a Inner,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).take();
        self.inner.processing.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn claim(&self, task: Option<&str>) -> std::result::Result<ProcessingGuard<'_>, EngineError> {
        let mut in_flight = lock(&self.in_flight);
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(match (task, in_flight.as_deref()) {
                (Some(task), Some(current)) if task == current => {
                    EngineError::DuplicateTask(task.to_string())
                }
                _ => EngineError::AlreadyRunning,
            });
        }
        *in_flight = task.map(str::to_string);
        // From here on a stop belongs to this run.
        self.control.send_replace(RunControl::Run);
        Ok(ProcessingGuard { inner: self })
    }
}

/// Drives tasks to completion. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: EngineConfig, transport: Arc<dyn Transport>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            transport,
            planner: None,
            evaluator: None,
            tools: ToolRegistry::new(),
            events: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Snapshot of the agent state.
    pub fn state(&self) -> AgentState {
        lock(&self.inner.state).clone()
    }

    /// Snapshot of the transcript.
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner.router).transcript().messages().to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EngineEvent>> {
        self.inner.events.subscribe()
    }

    /// Connection status. Never waits on a step in flight; while one runs
    /// this reports the status last observed.
    pub fn is_connected(&self) -> bool {
        if self.inner.link_down.load(Ordering::SeqCst) {
            return false;
        }
        match self.inner.session.try_lock() {
            Ok(session) => self.observe(&session),
            Err(_) => self.inner.connected.load(Ordering::SeqCst),
        }
    }

    /// Open the connection, retrying per the reconnect policy.
    pub async fn connect(&self) -> Result<()> {
        self.inner.link_down.store(false, Ordering::SeqCst);
        self.reconnect().await.map_err(Error::from)
    }

    /// Plan and run `task`.
    ///
    /// Rejected with [`EngineError::DuplicateTask`] if the same task is
    /// already running, [`EngineError::AlreadyRunning`] for any other
    /// concurrent run, and [`EngineError::NotConnected`] without a connection.
    pub async fn run_task(&self, task: &str) -> Result<RunOutcome> {
        let task = task.trim();
        if task.is_empty() {
            return Err(EngineError::EmptyTask.into());
        }
        let _guard = self.inner.claim(Some(task))?;
        let mut control = self.inner.control.subscribe();
        self.ensure_connected().await?;
        if *control.borrow() == RunControl::Stop {
            return Ok(self.settle(None));
        }
        self.inner.recoveries.store(0, Ordering::SeqCst);

        info!(task = %task, "Task accepted");
        self.publish(EngineEvent::TaskStarted {
            task: task.to_string(),
            timestamp: Utc::now(),
        });
        self.push(Message::user(task));
        self.transition(Transition::StartPlanning {
            task: task.to_string(),
        })?;

        let planned = {
            let mut session = self.inner.session.lock().await;
            let planned = tokio::select! {
                plan = self.inner.planner.plan(task, &mut session) => Some(plan),
                _ = stop_requested(&mut control) => None,
            };
            self.observe(&session);
            planned
        };

        let plan = match planned {
            _ if *control.borrow() == RunControl::Stop => return Ok(self.settle(None)),
            Some(Ok(plan)) => plan,
            Some(Err(e)) => {
                warn!(task = %task, error = %e, "Planning failed");
                let reason = format!("Planning failed: {e}");
                let _ = self.transition(Transition::Fail {
                    reason: reason.clone(),
                });
                self.publish(EngineEvent::ErrorOccurred {
                    context: "planning".into(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                self.finish(RunStatus::Failed, reason, None);
                return Err(e);
            }
            None => return Ok(self.settle(None)),
        };

        info!(plan_id = %plan.id, steps = plan.steps.len(), "Plan ready");
        self.publish(EngineEvent::PlanCreated {
            plan_id: plan.id.clone(),
            steps: plan.steps.len(),
            estimated_iterations: plan.estimated_iterations,
            timestamp: Utc::now(),
        });
        self.push(Message::agent(describe_plan(&plan)));
        if self.transition(Transition::PlanReady { plan }).is_err() {
            return Ok(self.settle(None));
        }

        Ok(self.drive(&mut control).await)
    }

    /// Stop issuing new steps. The in-flight step, if any, still finishes.
    pub fn pause(&self) -> std::result::Result<(), EngineError> {
        self.transition(Transition::Pause)?;
        self.inner.control.send_replace(RunControl::Pause);
        info!("Task paused");
        Ok(())
    }

    /// Continue a paused plan at its current step.
    pub async fn resume(&self) -> Result<RunOutcome> {
        let _guard = self.inner.claim(None)?;
        let mut control = self.inner.control.subscribe();
        self.ensure_connected().await?;
        if *control.borrow() == RunControl::Stop {
            return Ok(self.settle(None));
        }
        self.transition(Transition::Resume)?;

        let state = self.state();
        if let Some(step) = &state.current_step {
            info!(step_id = %step.id, "Task resumed");
            self.push(Message::agent(format!("Resuming at step '{}'", step.id)));
        }
        Ok(self.drive(&mut control).await)
    }

    /// Cancel whatever is happening. Valid in every state; clears the plan.
    pub fn stop(&self) {
        let was_active = self.state().phase.is_active();
        self.inner.control.send_replace(RunControl::Stop);
        let _ = self.transition(Transition::Stop);
        lock(&self.inner.router).abort("stopped");

        if was_active
            && let Some(tx) = lock(&self.inner.canceller).as_ref()
            && let Err(e) = tx.try_send(ClientFrame::StopGeneration {})
        {
            warn!(error = %e, "Could not send stop_generation");
        }

        // A running task reports its own summary on the way out.
        if !self.inner.processing.load(Ordering::SeqCst) {
            self.push(Message::agent("Stopped. The plan was cleared."));
        }
        info!("Task stopped");
    }

    /// Drop the transcript. Agent state is untouched.
    pub fn clear_messages(&self) {
        lock(&self.inner.router).clear();
    }

    async fn drive(&self, control: &mut watch::Receiver<RunControl>) -> RunOutcome {
        let mut last_evaluation: Option<EvaluationResult> = None;

        loop {
            let state = self.state();
            if state.phase != AgentPhase::Executing {
                return self.settle(last_evaluation);
            }
            let Some(mut plan) = state.current_plan.clone() else {
                return self.settle(last_evaluation);
            };
            if state.budget_exhausted() || plan.is_exhausted() {
                return self.exhaust(&state, &plan, last_evaluation);
            }
            let index = plan.current_step_index;
            let Some(step) = plan.current_step().cloned() else {
                return self.exhaust(&state, &plan, last_evaluation);
            };

            info!(step_id = %step.id, iteration = state.iteration + 1, "Executing step");
            self.publish(EngineEvent::StepStarted {
                step_id: step.id.clone(),
                iteration: state.iteration + 1,
                timestamp: Utc::now(),
            });

            let report = {
                let mut session = self.inner.session.lock().await;
                let report = self
                    .inner
                    .executor
                    .execute(&step, &mut session, &self.inner.router, control)
                    .await;
                self.observe(&session);
                report
            };

            if *control.borrow() != RunControl::Run || report.outcome == StepOutcome::Interrupted {
                return self.settle(last_evaluation);
            }

            if report.outcome == StepOutcome::Disconnected
                && let Err(e) = self.reconnect().await
            {
                let reason = format!("Connection lost and could not be restored: {e}");
                warn!(step_id = %step.id, error = %e, "Giving up after reconnect attempts");
                let _ = self.transition(Transition::Fail {
                    reason: reason.clone(),
                });
                self.publish(EngineEvent::ErrorOccurred {
                    context: "transport".into(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                return self.finish(RunStatus::Failed, reason, last_evaluation);
            }

            let result = report.result_text();
            plan.mark_step_complete(index, result.clone(), None);
            if self
                .transition(Transition::BeginEvaluation { plan: plan.clone() })
                .is_err()
            {
                return self.settle(last_evaluation);
            }

            let evaluation = self
                .inner
                .evaluator
                .evaluate(&plan, &result, &self.inner.criteria)
                .await;
            plan.mark_step_complete(index, result, Some(evaluation.reasoning.clone()));

            debug!(
                step_id = %step.id,
                quality = evaluation.quality,
                confidence = evaluation.confidence,
                complete = evaluation.is_complete,
                "Step evaluated"
            );
            self.publish(EngineEvent::Evaluated {
                step_id: step.id.clone(),
                quality: evaluation.quality,
                confidence: evaluation.confidence,
                is_complete: evaluation.is_complete,
                next_action: evaluation.next_action,
                timestamp: Utc::now(),
            });
            self.push(Message::agent(format!(
                "Step '{}' evaluated: {}",
                step.id, evaluation.reasoning
            )));

            if evaluation.is_complete {
                let reasoning = evaluation.reasoning.clone();
                if self
                    .transition(Transition::Complete { plan, reasoning })
                    .is_err()
                {
                    return self.settle(Some(evaluation));
                }
                let summary = format!("Task completed: {}", evaluation.reasoning);
                return self.finish(RunStatus::Completed, summary, Some(evaluation));
            }

            if evaluation.next_action == Some(NextAction::Recover) {
                self.schedule_recovery(&mut plan, &step, &evaluation);
            }
            plan.advance();
            let reasoning = evaluation.reasoning.clone();
            last_evaluation = Some(evaluation);
            if self
                .transition(Transition::Continue { plan, reasoning })
                .is_err()
            {
                return self.settle(last_evaluation);
            }
        }
    }

    /// Steps are only ever appended, so a recovery step runs after whatever
    /// planned steps remain.
    fn schedule_recovery(&self, plan: &mut Plan, step: &Step, evaluation: &EvaluationResult) {
        let max = self.inner.config.recovery.max_recovery_steps;
        let used = self.inner.recoveries.load(Ordering::SeqCst);
        if used >= max {
            debug!(step_id = %step.id, max, "Recovery budget spent");
            return;
        }
        self.inner.recoveries.store(used + 1, Ordering::SeqCst);

        let mut recovery = Step::new(
            format!("recovery_{}", used + 1),
            format!(
                "Recover from issues in step '{}' ({}): {}",
                step.id,
                step.description,
                evaluation.issues_found.join("; ")
            ),
        );
        recovery.required_tools = step.required_tools.clone();
        recovery.expected_outcome = format!("Issues from step '{}' are resolved", step.id);
        info!(step_id = %recovery.id, after = %step.id, "Recovery step scheduled");
        self.push(Message::agent(format!(
            "Scheduled recovery step '{}'",
            recovery.id
        )));
        plan.append_step(recovery);
    }

    fn exhaust(
        &self,
        state: &AgentState,
        plan: &Plan,
        last_evaluation: Option<EvaluationResult>,
    ) -> RunOutcome {
        let summary = if state.budget_exhausted() {
            format!(
                "Stopped after {} of {} iterations without meeting the completion criteria; {}/{} steps completed",
                state.iteration,
                state.max_iterations,
                plan.completed_count(),
                plan.steps.len()
            )
        } else {
            format!(
                "All {} planned steps ran without meeting the completion criteria ({} iterations)",
                plan.steps.len(),
                state.iteration
            )
        };
        warn!(iterations = state.iteration, "Task ended with partial completion");
        if self
            .transition(Transition::Exhaust {
                reasoning: summary.clone(),
            })
            .is_err()
        {
            return self.settle(last_evaluation);
        }
        self.finish(RunStatus::Partial, summary, last_evaluation)
    }

    /// Outcome for a run that ended because the state moved under it.
    fn settle(&self, last_evaluation: Option<EvaluationResult>) -> RunOutcome {
        let state = self.state();
        let (status, summary) = match state.phase {
            AgentPhase::Paused => {
                let at = state
                    .current_step
                    .as_ref()
                    .map(|s| s.id.as_str())
                    .unwrap_or("end of plan");
                (RunStatus::Paused, format!("Paused at step '{at}'"))
            }
            AgentPhase::Stopped => (RunStatus::Stopped, "Task stopped; the plan was cleared".into()),
            AgentPhase::Completed => (RunStatus::Completed, state.reasoning.clone()),
            phase => (RunStatus::Failed, format!("Run ended in unexpected phase '{phase}'")),
        };
        self.finish(status, summary, last_evaluation)
    }

    fn finish(
        &self,
        status: RunStatus,
        summary: String,
        evaluation: Option<EvaluationResult>,
    ) -> RunOutcome {
        let state = self.state();
        if status == RunStatus::Failed {
            self.push(Message::system(summary.clone()));
        } else {
            self.push(Message::agent(summary.clone()));
        }
        self.publish(EngineEvent::TaskFinished {
            phase: state.phase,
            iterations: state.iteration,
            timestamp: Utc::now(),
        });
        info!(status = ?status, iterations = state.iteration, "Run finished");
        RunOutcome {
            status,
            iterations: state.iteration,
            summary,
            evaluation,
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.inner.link_down.load(Ordering::SeqCst) {
            self.push(Message::system(
                "Not connected to the completion service; task rejected",
            ));
            return Err(EngineError::NotConnected.into());
        }
        if self.observe(&*self.inner.session.lock().await) {
            return Ok(());
        }
        if let Err(e) = self.reconnect().await {
            self.push(Message::system(format!(
                "Could not reach the completion service: {e}"
            )));
            return Err(EngineError::NotConnected.into());
        }
        Ok(())
    }

    async fn reconnect(&self) -> std::result::Result<(), TransportError> {
        let mut session = self.inner.session.lock().await;
        let result = session.connect().await;
        match &result {
            Ok(()) => *lock(&self.inner.canceller) = session.sender(),
            Err(_) => {
                self.inner.link_down.store(true, Ordering::SeqCst);
                *lock(&self.inner.canceller) = None;
            }
        }
        self.observe(&session);
        result
    }

    /// Record and return the live status of `session`.
    fn observe(&self, session: &Session) -> bool {
        let connected = session.is_connected();
        self.inner.connected.store(connected, Ordering::SeqCst);
        connected
    }

    fn transition(&self, transition: Transition) -> std::result::Result<(), EngineError> {
        let (from, to) = {
            let mut state = lock(&self.inner.state);
            let next = state.apply(transition)?;
            let from = state.phase;
            *state = next;
            (from, state.phase)
        };
        if from != to {
            debug!(from = %from, to = %to, "State transition");
            self.publish(EngineEvent::StateChanged {
                from,
                to,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    fn push(&self, message: Message) {
        lock(&self.inner.router).push(message);
    }

    fn publish(&self, event: EngineEvent) {
        self.inner.events.publish(event);
    }
}

/// Resolves once a stop has been requested. Never resolves if the control
/// channel closes first.
async fn stop_requested(control: &mut watch::Receiver<RunControl>) {
    loop {
        if *control.borrow_and_update() == RunControl::Stop {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn describe_plan(plan: &Plan) -> String {
    let mut text = format!(
        "Plan {} ({} step(s), ~{} iteration(s)):",
        plan.id,
        plan.steps.len(),
        plan.estimated_iterations
    );
    for (i, step) in plan.steps.iter().enumerate() {
        text.push_str(&format!("\n{}. {}", i + 1, step.description));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::StaticPlanner;
    use serde_json::json;
    use stepwise_core::message::Role;
    use stepwise_transport::{ScriptedReply, ScriptedTransport};

    const WIN: &str = "Completed successfully. All tests passed and the result was verified.";

    fn config(max_iterations: u32) -> EngineConfig {
        EngineConfig {
            max_iterations,
            ..EngineConfig::default()
        }
    }

    fn five_steps() -> StaticPlanner {
        StaticPlanner::new(json!({
            "steps": ["one", "two", "three", "four", "five"]
        }))
    }

    fn orchestrator(transport: &ScriptedTransport, planner: StaticPlanner, max: u32) -> Orchestrator {
        Orchestrator::builder(config(max), Arc::new(transport.clone()))
            .with_planner(planner)
            .build()
    }

    #[tokio::test]
    async fn completes_when_evaluation_is_satisfied() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&[WIN])]);
        let orch = orchestrator(&transport, five_steps(), 10);

        let outcome = orch.run_task("ship it").await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 1);
        let state = orch.state();
        assert_eq!(state.phase, AgentPhase::Completed);
        assert!(!state.is_active);
        assert_eq!(state.progress, 100.0);
        let plan = state.current_plan.unwrap();
        assert!(plan.steps[0].is_complete);
        assert!(plan.steps[1..].iter().all(|s| !s.is_complete));
    }

    #[tokio::test]
    async fn iteration_cap_ends_in_partial_state() {
        let transport = ScriptedTransport::with_replies(
            (0..5).map(|_| ScriptedReply::completion(&["Looked into it."])),
        );
        let orch = orchestrator(&transport, five_steps(), 3);

        let outcome = orch.run_task("never satisfied").await.unwrap();

        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(transport.sent_messages().len(), 3);
        let state = orch.state();
        assert_eq!(state.phase, AgentPhase::Stopped);
        assert!(state.current_plan.is_some());
        assert!(state.iteration <= state.max_iterations);
        assert!(orch.messages().last().unwrap().content.contains("3 of 3 iterations"));
    }

    #[tokio::test]
    async fn exhausted_plan_reports_partial() {
        let transport = ScriptedTransport::with_replies(
            (0..2).map(|_| ScriptedReply::completion(&["Looked into it."])),
        );
        let planner = StaticPlanner::new(json!({"steps": ["one", "two"]}));
        let orch = orchestrator(&transport, planner, 10);

        let outcome = orch.run_task("two steps").await.unwrap();
        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.iterations, 2);
        assert!(outcome.summary.contains("All 2 planned steps"));
    }

    #[tokio::test]
    async fn failing_step_schedules_bounded_recovery() {
        let transport = ScriptedTransport::with_replies(
            (0..6).map(|_| ScriptedReply::error("tool crashed")),
        );
        let planner = StaticPlanner::new(json!({"steps": ["one"]}));
        let orch = orchestrator(&transport, planner, 10);

        let outcome = orch.run_task("fragile").await.unwrap();

        assert_eq!(outcome.status, RunStatus::Partial);
        let plan = orch.state().current_plan.unwrap();
        let ids: Vec<_> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["step_1", "recovery_1", "recovery_2"]);
        assert_eq!(transport.sent_messages().len(), 3);
    }

    #[tokio::test]
    async fn recovery_runs_after_the_remaining_planned_steps() {
        let transport = ScriptedTransport::with_replies(
            (0..4).map(|_| ScriptedReply::error("tool crashed")),
        );
        let planner = StaticPlanner::new(json!({"steps": ["one", "two", "three"]}));
        let mut config = config(10);
        config.recovery.max_recovery_steps = 1;
        let orch = Orchestrator::builder(config, Arc::new(transport.clone()))
            .with_planner(planner)
            .build();

        orch.run_task("fragile").await.unwrap();

        let plan = orch.state().current_plan.unwrap();
        let ids: Vec<_> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["step_1", "step_2", "step_3", "recovery_1"]);
        let sent = transport.sent_messages();
        assert_eq!(&sent[..3], ["one", "two", "three"]);
        assert!(sent[3].starts_with("Recover from issues in step 'step_1'"));
    }

    #[tokio::test]
    async fn upstream_error_is_a_step_result_not_a_crash() {
        let transport = ScriptedTransport::with_replies([
            ScriptedReply::error("rate limited"),
            ScriptedReply::completion(&[WIN]),
        ]);
        let planner = StaticPlanner::new(json!({"steps": ["one", "two"]}));
        let mut config = config(10);
        config.recovery.max_recovery_steps = 0;
        let orch = Orchestrator::builder(config, Arc::new(transport.clone()))
            .with_planner(planner)
            .build();

        let outcome = orch.run_task("flaky").await.unwrap();

        // The earlier failure keeps confidence below the bar.
        assert_eq!(outcome.status, RunStatus::Partial);
        let plan = orch.state().current_plan.unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[0].result.as_deref().unwrap().contains("rate limited"));
        assert_eq!(plan.steps[1].result.as_deref(), Some(WIN));
        assert!(plan.steps[1].reasoning.is_some());
    }

    #[tokio::test]
    async fn mark_complete_touches_only_current_step() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&["Looked."])]);
        let orch = orchestrator(&transport, five_steps(), 1);

        orch.run_task("one pass").await.unwrap();
        let plan = orch.state().current_plan.unwrap();
        let flags: Vec<bool> = plan.steps.iter().map(|s| s.is_complete).collect();
        assert_eq!(flags, vec![true, false, false, false, false]);
    }

    #[tokio::test]
    async fn rejects_when_connection_cannot_be_made() {
        let transport = ScriptedTransport::new();
        transport.fail_connects(10);
        let mut config = config(10);
        config.transport.reconnect_backoff_ms = 1;
        let orch = Orchestrator::builder(config, Arc::new(transport.clone()))
            .with_planner(five_steps())
            .build();

        let err = orch.run_task("anything").await.unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::NotConnected)));
        assert_eq!(orch.state().phase, AgentPhase::Idle);

        // Once marked down, further tasks fail without new attempts.
        let err = orch.run_task("again").await.unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::NotConnected)));
        assert_eq!(transport.connects(), 0);
        assert!(
            orch.messages()
                .iter()
                .any(|m| m.role == Role::System && m.content.contains("Not connected"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_connect_backoff_ends_the_run() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&[WIN])]);
        transport.fail_connects(2);
        let orch = orchestrator(&transport, five_steps(), 10);

        let run = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_task("late stop").await })
        };
        while transport.connect_attempts() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(orch.state().phase, AgentPhase::Idle);
        orch.stop();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome.status, RunStatus::Stopped);
        let state = orch.state();
        assert_eq!(state.phase, AgentPhase::Stopped);
        assert!(state.current_plan.is_none());
        assert!(transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn planning_disconnect_aborts_run() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::Disconnect]);
        let mut config = config(10);
        config.transport.max_reconnect_attempts = 1;
        let orch = Orchestrator::builder(config, Arc::new(transport.clone())).build();

        let err = orch.run_task("plan me").await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Disconnected)));
        assert_eq!(orch.state().phase, AgentPhase::Failed);
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::Silent]);
        let orch = orchestrator(&transport, five_steps(), 10);

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_task("same task").await })
        };
        while !orch.state().is_executing {
            tokio::task::yield_now().await;
        }

        let dup = orch.run_task("same task").await.unwrap_err();
        assert!(matches!(dup, Error::Engine(EngineError::DuplicateTask(_))));
        let other = orch.run_task("other task").await.unwrap_err();
        assert!(matches!(other, Error::Engine(EngineError::AlreadyRunning)));

        orch.stop();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.status, RunStatus::Stopped);
        assert!(transport.sent_messages().len() <= 1);
        assert!(orch.state().current_plan.is_none());

        for _ in 0..100 {
            if transport
                .sent()
                .iter()
                .any(|f| matches!(f, ClientFrame::StopGeneration {}))
            {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("stop_generation was never sent");
    }

    #[tokio::test(start_paused = true)]
    async fn pause_lets_step_finish_then_resume_continues() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::Silent]);
        let planner = StaticPlanner::new(json!({"steps": ["one", "two"]}));
        let orch = orchestrator(&transport, planner, 10);

        let run = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_task("pausable").await })
        };
        while !orch.state().is_executing {
            tokio::task::yield_now().await;
        }
        orch.pause().unwrap();
        let paused = orch.state();
        assert_eq!(paused.phase, AgentPhase::Paused);
        assert!(!paused.is_active);
        assert!(paused.current_plan.is_some());

        // The in-flight step runs to its timeout rather than being cut off.
        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome.status, RunStatus::Paused);
        assert!(orch.messages().iter().any(|m| m.content.contains("timed out")));
        let plan = orch.state().current_plan.unwrap();
        assert_eq!(plan.current_step_index, 0);
        assert!(!plan.steps[0].is_complete);

        transport.push(ScriptedReply::completion(&[WIN]));
        let resumed = orch.resume().await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(transport.sent_messages(), vec!["one", "one"]);
    }

    #[tokio::test]
    async fn connection_status_does_not_wait_on_a_running_step() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::Silent]);
        let orch = orchestrator(&transport, five_steps(), 10);
        assert!(!orch.is_connected());

        let run = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_task("long step").await })
        };
        while !orch.state().is_executing {
            tokio::task::yield_now().await;
        }
        // The step holds the session until its reply or timeout.
        assert!(orch.is_connected());

        orch.stop();
        run.await.unwrap().unwrap();
        assert!(orch.is_connected());
    }

    #[tokio::test]
    async fn resume_without_plan_is_rejected() {
        let transport = ScriptedTransport::new();
        let orch = orchestrator(&transport, five_steps(), 10);
        let err = orch.resume().await.unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::NoPlan)));
    }

    #[tokio::test]
    async fn stop_when_idle_clears_and_notes() {
        let transport = ScriptedTransport::new();
        let orch = orchestrator(&transport, five_steps(), 10);
        orch.stop();
        let state = orch.state();
        assert_eq!(state.phase, AgentPhase::Stopped);
        assert!(state.current_plan.is_none());
        assert!(orch.messages().last().unwrap().content.contains("Stopped"));
    }

    #[tokio::test]
    async fn clear_messages_keeps_state() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&[WIN])]);
        let orch = orchestrator(&transport, five_steps(), 10);
        orch.run_task("ship it").await.unwrap();

        let before = orch.state();
        orch.clear_messages();
        assert!(orch.messages().is_empty());
        assert_eq!(orch.state(), before);
    }

    #[tokio::test]
    async fn events_trace_the_run() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&[WIN])]);
        let orch = orchestrator(&transport, five_steps(), 10);
        let mut events = orch.subscribe();

        orch.run_task("ship it").await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event.as_ref() {
                EngineEvent::TaskStarted { .. } => "task_started",
                EngineEvent::PlanCreated { .. } => "plan_created",
                EngineEvent::StepStarted { .. } => "step_started",
                EngineEvent::StepFinished { .. } => "step_finished",
                EngineEvent::Evaluated { .. } => "evaluated",
                EngineEvent::TaskFinished { .. } => "task_finished",
                _ => continue,
            });
        }
        assert_eq!(
            kinds,
            vec![
                "task_started",
                "plan_created",
                "step_started",
                "step_finished",
                "evaluated",
                "task_finished"
            ]
        );
    }
}
