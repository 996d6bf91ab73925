//! Agent state machine, evaluation criteria, and evaluation results.
//!
//! [`AgentState`] is the single source of truth for what the engine is
//! doing. It is never mutated in place by the orchestrator: every change
//! goes through [`AgentState::apply`], which validates the transition and
//! returns the next state.
//!
//! ```text
//! Idle → Planning → Executing ⇄ Evaluating → { Completed | Stopped | Failed }
//!                       │  ▲
//!                 pause ▼  │ resume
//!                      Paused
//! ```

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::plan::{Plan, Step};

/// The engine's lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    #[default]
    Idle,
    Planning,
    Executing,
    Evaluating,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl AgentPhase {
    /// Planning, executing, or evaluating.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Planning | Self::Executing | Self::Evaluating)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Evaluating => "evaluating",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move the state machine.
#[derive(Debug, Clone)]
pub enum Transition {
    /// A task was accepted; request a plan.
    StartPlanning { task: String },
    /// The planner produced a plan; start executing it.
    PlanReady { plan: Plan },
    /// A step result arrived; score it.
    BeginEvaluation { plan: Plan },
    /// Evaluation asked for another pass. `plan` carries the advanced cursor.
    Continue { plan: Plan, reasoning: String },
    /// Evaluation declared the task complete.
    Complete { plan: Plan, reasoning: String },
    /// Iteration budget or step list ran out without completion.
    Exhaust { reasoning: String },
    /// Stop issuing new step requests; keep the plan.
    Pause,
    /// Re-enter execution at the preserved cursor.
    Resume,
    /// Unconditional cancellation. Clears the plan.
    Stop,
    /// Unrecoverable failure.
    Fail { reason: String },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartPlanning { .. } => "start_planning",
            Self::PlanReady { .. } => "plan_ready",
            Self::BeginEvaluation { .. } => "begin_evaluation",
            Self::Continue { .. } => "continue",
            Self::Complete { .. } => "complete",
            Self::Exhaust { .. } => "exhaust",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Fail { .. } => "fail",
        }
    }
}

/// Runtime state of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub phase: AgentPhase,
    pub is_active: bool,
    pub is_planning: bool,
    pub is_executing: bool,
    pub is_evaluating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<Step>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub reasoning: String,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
}

impl AgentState {
    /// A fresh, idle state with the given iteration budget.
    pub fn new(max_iterations: u32) -> Self {
        Self {
            phase: AgentPhase::Idle,
            is_active: false,
            is_planning: false,
            is_executing: false,
            is_evaluating: false,
            current_plan: None,
            current_step: None,
            iteration: 0,
            max_iterations: max_iterations.max(1),
            reasoning: String::new(),
            progress: 0.0,
        }
    }

    /// Whether the iteration budget has been spent.
    pub fn budget_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    /// Validate `transition` against the current phase and return the next state.
    pub fn apply(&self, transition: Transition) -> Result<AgentState, EngineError> {
        use AgentPhase::*;

        let invalid = |t: &Transition| EngineError::InvalidTransition {
            from: self.phase.to_string(),
            transition: t.name().to_string(),
        };

        let mut next = self.clone();
        match transition {
            Transition::StartPlanning { task } => {
                if self.phase.is_active() {
                    return Err(EngineError::AlreadyRunning);
                }
                next.current_plan = None;
                next.current_step = None;
                next.iteration = 0;
                next.progress = 0.0;
                next.reasoning = format!("Planning: {task}");
                next.set_phase(Planning);
            }
            Transition::PlanReady { plan } => {
                if self.phase != Planning {
                    return Err(invalid(&Transition::PlanReady { plan }));
                }
                next.reasoning = format!("Plan ready with {} step(s)", plan.steps.len());
                next.track_plan(plan);
                next.set_phase(Executing);
            }
            Transition::BeginEvaluation { plan } => {
                if self.phase != Executing {
                    return Err(invalid(&Transition::BeginEvaluation { plan }));
                }
                next.reasoning = "Evaluating step result".into();
                next.track_plan(plan);
                next.set_phase(Evaluating);
            }
            Transition::Continue { plan, reasoning } => {
                if self.phase != Evaluating {
                    return Err(invalid(&Transition::Continue { plan, reasoning }));
                }
                next.bump_iteration();
                next.track_plan(plan);
                next.reasoning = reasoning;
                next.set_phase(Executing);
            }
            Transition::Complete { plan, reasoning } => {
                if self.phase != Evaluating {
                    return Err(invalid(&Transition::Complete { plan, reasoning }));
                }
                next.bump_iteration();
                next.track_plan(plan);
                next.current_step = None;
                next.progress = 100.0;
                next.reasoning = reasoning;
                next.set_phase(Completed);
            }
            Transition::Exhaust { reasoning } => {
                if !matches!(self.phase, Executing | Evaluating) {
                    return Err(invalid(&Transition::Exhaust { reasoning }));
                }
                next.current_step = None;
                next.reasoning = reasoning;
                next.set_phase(Stopped);
            }
            Transition::Pause => {
                if !matches!(self.phase, Executing | Evaluating) {
                    return Err(invalid(&Transition::Pause));
                }
                next.reasoning = "Paused".into();
                next.set_phase(Paused);
            }
            Transition::Resume => {
                if self.phase != Paused || self.current_plan.is_none() {
                    return Err(if self.current_plan.is_none() {
                        EngineError::NoPlan
                    } else {
                        invalid(&Transition::Resume)
                    });
                }
                next.current_step = self
                    .current_plan
                    .as_ref()
                    .and_then(|p| p.current_step().cloned());
                next.reasoning = "Resumed".into();
                next.set_phase(Executing);
            }
            Transition::Stop => {
                next.current_plan = None;
                next.current_step = None;
                next.reasoning = "Stopped".into();
                next.set_phase(Stopped);
            }
            Transition::Fail { reason } => {
                if !self.phase.is_active() {
                    return Err(invalid(&Transition::Fail { reason }));
                }
                next.current_step = None;
                next.reasoning = reason;
                next.set_phase(Failed);
            }
        }
        Ok(next)
    }

    fn set_phase(&mut self, phase: AgentPhase) {
        self.phase = phase;
        self.is_active = phase.is_active();
        self.is_planning = phase == AgentPhase::Planning;
        self.is_executing = phase == AgentPhase::Executing;
        self.is_evaluating = phase == AgentPhase::Evaluating;
    }

    fn track_plan(&mut self, plan: Plan) {
        self.current_step = plan.current_step().cloned();
        self.progress = plan.progress_percent();
        self.current_plan = Some(plan);
    }

    fn bump_iteration(&mut self) {
        self.iteration = (self.iteration + 1).min(self.max_iterations);
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Thresholds the evaluator applies to a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationCriteria {
    pub minimum_confidence: f64,
    pub quality_threshold: f64,
    pub must_meet_all_criteria: bool,
    pub allow_partial_completion: bool,
}

impl Default for EvaluationCriteria {
    fn default() -> Self {
        Self {
            minimum_confidence: 0.8,
            quality_threshold: 0.7,
            must_meet_all_criteria: true,
            allow_partial_completion: false,
        }
    }
}

/// Qualitative bucket for a quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl QualityLabel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::Excellent
        } else if score >= 0.7 {
            Self::Good
        } else if score >= 0.5 {
            Self::Acceptable
        } else {
            Self::Poor
        }
    }
}

/// What the evaluator recommends the orchestrator do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// The task is done.
    Finish,
    /// Move on to the next planned step.
    Proceed,
    /// The last step went wrong; schedule a recovery step.
    Recover,
}

/// The verdict for one evaluation call. Never mutated after return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub is_complete: bool,
    pub confidence: f64,
    pub quality: f64,
    pub quality_label: QualityLabel,
    pub should_continue: bool,
    pub reasoning: String,
    pub recommendations: Vec<String>,
    pub issues_found: Vec<String>,
    pub improvement_suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<NextAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(n: usize) -> Plan {
        Plan {
            id: "p".into(),
            task: "t".into(),
            steps: (1..=n)
                .map(|i| Step::new(format!("step_{i}"), format!("Step {i}")))
                .collect(),
            completion_criteria: vec![],
            estimated_iterations: n as u32,
            current_step_index: 0,
        }
    }

    fn executing(max: u32) -> AgentState {
        AgentState::new(max)
            .apply(Transition::StartPlanning { task: "t".into() })
            .unwrap()
            .apply(Transition::PlanReady { plan: plan(3) })
            .unwrap()
    }

    #[test]
    fn agent_state_starts_idle() {
        let state = AgentState::default();
        assert_eq!(state.phase, AgentPhase::Idle);
        assert!(!state.is_active);
        assert_eq!(state.iteration, 0);
    }

    #[test]
    fn planning_to_executing_sets_flags() {
        let state = executing(5);
        assert!(state.is_active);
        assert!(state.is_executing);
        assert!(!state.is_planning);
        assert_eq!(state.current_step.as_ref().unwrap().id, "step_1");
    }

    #[test]
    fn start_planning_rejected_while_active() {
        let state = executing(5);
        let err = state
            .apply(Transition::StartPlanning { task: "again".into() })
            .unwrap_err();
        assert_eq!(err, EngineError::AlreadyRunning);
    }

    #[test]
    fn iteration_never_exceeds_max() {
        let mut state = executing(2);
        for _ in 0..5 {
            let p = state.current_plan.clone().unwrap();
            state = state
                .apply(Transition::BeginEvaluation { plan: p.clone() })
                .unwrap()
                .apply(Transition::Continue {
                    plan: p,
                    reasoning: "again".into(),
                })
                .unwrap();
            assert!(state.iteration <= state.max_iterations);
        }
        assert_eq!(state.iteration, 2);
        assert!(state.budget_exhausted());
    }

    #[test]
    fn stop_clears_plan_from_every_phase() {
        let planning = AgentState::new(3)
            .apply(Transition::StartPlanning { task: "t".into() })
            .unwrap();
        let exec = executing(3);
        let eval = exec
            .apply(Transition::BeginEvaluation { plan: plan(3) })
            .unwrap();
        let paused = exec.apply(Transition::Pause).unwrap();

        for state in [planning, exec, eval, paused] {
            let stopped = state.apply(Transition::Stop).unwrap();
            assert!(!stopped.is_active);
            assert!(!stopped.is_planning && !stopped.is_executing && !stopped.is_evaluating);
            assert!(stopped.current_plan.is_none());
            assert!(stopped.current_step.is_none());
        }
    }

    #[test]
    fn pause_keeps_plan_and_resume_restores_executing() {
        let paused = executing(3).apply(Transition::Pause).unwrap();
        assert!(!paused.is_active);
        assert!(paused.current_plan.is_some());

        let resumed = paused.apply(Transition::Resume).unwrap();
        assert!(resumed.is_executing);
        assert_eq!(resumed.current_step.unwrap().id, "step_1");
    }

    #[test]
    fn resume_without_plan_is_rejected() {
        let err = AgentState::new(3).apply(Transition::Resume).unwrap_err();
        assert_eq!(err, EngineError::NoPlan);
    }

    #[test]
    fn pause_from_idle_is_invalid() {
        let err = AgentState::new(3).apply(Transition::Pause).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn complete_sets_full_progress() {
        let state = executing(3);
        let p = state.current_plan.clone().unwrap();
        let done = state
            .apply(Transition::BeginEvaluation { plan: p.clone() })
            .unwrap()
            .apply(Transition::Complete {
                plan: p,
                reasoning: "done".into(),
            })
            .unwrap();
        assert_eq!(done.phase, AgentPhase::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(!done.is_active);
    }

    #[test]
    fn quality_label_buckets() {
        assert_eq!(QualityLabel::from_score(0.95), QualityLabel::Excellent);
        assert_eq!(QualityLabel::from_score(0.7), QualityLabel::Good);
        assert_eq!(QualityLabel::from_score(0.5), QualityLabel::Acceptable);
        assert_eq!(QualityLabel::from_score(0.1), QualityLabel::Poor);
    }

    #[test]
    fn evaluation_criteria_defaults() {
        let c = EvaluationCriteria::default();
        assert_eq!(c.minimum_confidence, 0.8);
        assert_eq!(c.quality_threshold, 0.7);
        assert!(c.must_meet_all_criteria);
        assert!(!c.allow_partial_completion);
    }
}
