//! Evaluation — decides whether a task is done after each step.
//!
//! [`Evaluator`] is the seam the orchestrator depends on. [`LexicalEvaluator`]
//! is the built-in strategy: three independent passes over the plan and the
//! latest result text, combined conservatively.
//!
//! 1. **Progress**: completed/total steps and failures among completed results
//! 2. **Completion**: success vs. failure wording and completion-criteria coverage
//! 3. **Quality**: a 0.5 baseline adjusted by weighted positive and negative signals
//!
//! The reported confidence is the minimum of the three passes.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use stepwise_core::agent::{EvaluationCriteria, EvaluationResult, NextAction, QualityLabel};
use stepwise_core::plan::Plan;

use crate::structure::DEFAULT_COMPLETION_CRITERION;

/// Scores a step result against the plan.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        plan: &Plan,
        result: &str,
        criteria: &EvaluationCriteria,
    ) -> EvaluationResult;
}

fn pattern(re: &str) -> Regex {
    Regex::new(re).expect("valid evaluator pattern")
}

static FAILURE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b(errors?|failed|failure|unable|timed out)\b"));
static SUCCESS: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(success|successful|successfully|succeeded|completed?|done|finished)\b")
});
static TESTS_PASSING: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\btests?\s+(pass|passed|passing)\b"));
static OPTIMIZATION: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(optimi[sz]ed|optimi[sz]ation|optimi[sz]e|efficient|efficiently|faster)\b")
});
static PARTIAL: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b(partial|partially|incomplete|unfinished|not yet)\b"));
static WARNING: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)\bwarnings?\b"));

static SCRIPTING_TASK: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(script|scripts|scripting|expressions?|jsx|extendscript|code|function)\b")
});
static MEDIA_TASK: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(render|video|image|masks?|composition|comp|layers?|footage|animation|keyframes?)\b")
});
static DOCUMENTATION_TASK: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(docs?|documentation|explain|how (do|to)|what is)\b")
});

static SCRIPTING_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(valid syntax|syntax is valid|compiled|executed|ran without)\b")
});
static MEDIA_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(rendered|exported|generated|created|applied|added)\b")
});
static DOCUMENTATION_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(according to|documentation|reference|example)\b")
});
static GENERAL_SIGNAL: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b(verified|confirmed)\b"));

const STOPWORDS: &[&str] = &[
    "that", "this", "with", "have", "been", "from", "into", "should", "must", "will", "task",
    "when", "then", "each", "their", "there",
];

/// Broad kind of task, used for category-specific quality signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    Scripting,
    Media,
    Documentation,
    General,
}

impl TaskCategory {
    pub fn detect(task: &str) -> Self {
        if SCRIPTING_TASK.is_match(task) {
            Self::Scripting
        } else if MEDIA_TASK.is_match(task) {
            Self::Media
        } else if DOCUMENTATION_TASK.is_match(task) {
            Self::Documentation
        } else {
            Self::General
        }
    }

    fn signal(self) -> &'static Regex {
        match self {
            Self::Scripting => &SCRIPTING_SIGNAL,
            Self::Media => &MEDIA_SIGNAL,
            Self::Documentation => &DOCUMENTATION_SIGNAL,
            Self::General => &GENERAL_SIGNAL,
        }
    }
}

/// A weighted quality signal found in a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Success,
    TestsPassing,
    Optimization,
    CategorySpecific,
    Errors,
    Partial,
    Warnings,
}

impl Signal {
    pub fn weight(self) -> f64 {
        match self {
            Self::Success => 0.2,
            Self::TestsPassing | Self::Optimization | Self::CategorySpecific => 0.1,
            Self::Errors => -0.3,
            Self::Partial => -0.2,
            Self::Warnings => -0.1,
        }
    }

    fn issue(self) -> Option<&'static str> {
        match self {
            Self::Errors => Some("Result reports errors"),
            Self::Partial => Some("Result is partial or incomplete"),
            Self::Warnings => Some("Result mentions warnings"),
            _ => None,
        }
    }

    fn suggestion(self) -> Option<&'static str> {
        match self {
            Self::Errors => Some("Fix the reported errors"),
            Self::Partial => Some("Complete the remaining work"),
            Self::Warnings => Some("Address the reported warnings"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressAnalysis {
    pub completed: usize,
    pub total: usize,
    /// Percentage in `[0, 100]`.
    pub percent: f64,
    pub has_errors: bool,
    pub issues: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionCheck {
    pub task_fulfilled: bool,
    pub confidence: f64,
    pub missing_elements: Vec<String>,
    pub reports_success: bool,
    pub reports_failure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityAssessment {
    pub score: f64,
    pub label: QualityLabel,
    pub confidence: f64,
    pub signals: Vec<Signal>,
}

impl QualityAssessment {
    fn has(&self, signal: Signal) -> bool {
        self.signals.contains(&signal)
    }
}

/// Keyword-heuristic evaluator. Pure and deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalEvaluator;

impl LexicalEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Pass 1: step completion ratio and failures among completed results.
    pub fn analyze_progress(&self, plan: &Plan) -> ProgressAnalysis {
        let total = plan.steps.len();
        let completed = plan.completed_count();
        let issues: Vec<String> = plan
            .steps
            .iter()
            .filter(|s| s.is_complete)
            .filter(|s| s.result.as_deref().is_some_and(|r| FAILURE.is_match(r)))
            .map(|s| format!("Step '{}' reported a failure", s.id))
            .collect();

        let confidence = if completed == 0 {
            1.0
        } else {
            1.0 - 0.5 * issues.len() as f64 / completed as f64
        };

        ProgressAnalysis {
            completed,
            total,
            percent: plan.progress_percent(),
            has_errors: !issues.is_empty(),
            issues,
            confidence: round2(confidence),
        }
    }

    /// Pass 2: does the result, together with earlier step results, satisfy
    /// the task and its completion criteria?
    pub fn check_completion(
        &self,
        plan: &Plan,
        result: &str,
        must_meet_all: bool,
    ) -> CompletionCheck {
        let reports_success = SUCCESS.is_match(result);
        let reports_failure = FAILURE.is_match(result);

        let mut evidence = result.to_lowercase();
        for step in plan.steps.iter().filter(|s| s.is_complete) {
            if let Some(r) = &step.result {
                evidence.push('\n');
                evidence.push_str(&r.to_lowercase());
            }
        }

        let criteria: Vec<&str> = if plan.completion_criteria.is_empty() {
            vec![DEFAULT_COMPLETION_CRITERION]
        } else {
            plan.completion_criteria.iter().map(String::as_str).collect()
        };

        let missing_elements: Vec<String> = criteria
            .iter()
            .filter(|c| !criterion_covered(c, &evidence, reports_success))
            .map(|c| c.to_string())
            .collect();
        let covered = criteria.len() - missing_elements.len();
        let coverage = covered as f64 / criteria.len() as f64;

        let criteria_met = if must_meet_all {
            missing_elements.is_empty()
        } else {
            covered > 0
        };
        let task_fulfilled = reports_success && !reports_failure && criteria_met;

        let confidence = if reports_failure {
            0.2
        } else if reports_success {
            0.7 + 0.3 * coverage
        } else {
            0.4
        };

        CompletionCheck {
            task_fulfilled,
            confidence: round2(confidence),
            missing_elements,
            reports_success,
            reports_failure,
        }
    }

    /// Pass 3: weighted quality score for the result text.
    pub fn assess_quality(&self, task: &str, result: &str) -> QualityAssessment {
        let category = TaskCategory::detect(task);
        let checks: [(Signal, &Regex); 7] = [
            (Signal::Success, &SUCCESS),
            (Signal::TestsPassing, &TESTS_PASSING),
            (Signal::Optimization, &OPTIMIZATION),
            (Signal::CategorySpecific, category.signal()),
            (Signal::Errors, &FAILURE),
            (Signal::Partial, &PARTIAL),
            (Signal::Warnings, &WARNING),
        ];

        let signals: Vec<Signal> = checks
            .iter()
            .filter(|(_, re)| re.is_match(result))
            .map(|(signal, _)| *signal)
            .collect();

        let raw = 0.5 + signals.iter().map(|s| s.weight()).sum::<f64>();
        let score = round2(raw.clamp(0.0, 1.0));

        QualityAssessment {
            score,
            label: QualityLabel::from_score(score),
            confidence: round2(0.5 + (score - 0.5).abs()),
            signals,
        }
    }

    /// Combine the three passes into a verdict.
    pub fn assess(
        &self,
        plan: &Plan,
        result: &str,
        criteria: &EvaluationCriteria,
    ) -> EvaluationResult {
        let progress = self.analyze_progress(plan);
        let completion = self.check_completion(plan, result, criteria.must_meet_all_criteria);
        let quality = self.assess_quality(&plan.task, result);

        let confidence = progress
            .confidence
            .min(completion.confidence)
            .min(quality.confidence)
            .clamp(0.0, 1.0);

        let meets_all = completion.task_fulfilled
            && quality.score >= criteria.quality_threshold
            && confidence >= criteria.minimum_confidence;
        let meets_partial = criteria.allow_partial_completion
            && progress.percent >= 80.0
            && quality.score >= 0.8 * criteria.quality_threshold;
        let is_complete = meets_all || meets_partial;

        let mut recommendations = Vec::new();
        if !completion.task_fulfilled {
            if completion.reports_failure {
                recommendations.push("Resolve the errors reported by the last step".to_string());
            } else if !completion.reports_success {
                recommendations
                    .push("Report the outcome explicitly so completion can be verified".into());
            }
            for missing in &completion.missing_elements {
                recommendations.push(format!("Satisfy remaining criterion: {missing}"));
            }
        }
        if quality.score < criteria.quality_threshold {
            recommendations.push(format!(
                "Raise result quality from {:.2} to at least {:.2}",
                quality.score, criteria.quality_threshold
            ));
        }
        if confidence < criteria.minimum_confidence {
            recommendations.push(format!(
                "Increase confidence from {:.2} to at least {:.2}",
                confidence, criteria.minimum_confidence
            ));
        }
        if progress.has_errors {
            recommendations.push("Re-run or recover the failed steps".into());
        }

        let mut issues_found = progress.issues.clone();
        issues_found.extend(
            quality
                .signals
                .iter()
                .filter_map(|s| s.issue())
                .map(str::to_string),
        );

        let mut improvement_suggestions: Vec<String> = quality
            .signals
            .iter()
            .filter_map(|s| s.suggestion())
            .map(str::to_string)
            .collect();
        if !quality.has(Signal::Success) {
            improvement_suggestions.push("State clearly what was accomplished".into());
        }

        let next_action = if is_complete {
            NextAction::Finish
        } else if quality.has(Signal::Errors) || quality.has(Signal::Partial) {
            NextAction::Recover
        } else {
            NextAction::Proceed
        };

        let verdict = if meets_all {
            "task complete"
        } else if meets_partial {
            "accepted as partial completion"
        } else {
            "more work needed"
        };
        let reasoning = format!(
            "Progress {:.0}% ({}/{} steps), quality {:.2} ({:?}), confidence {:.2}: {verdict}",
            progress.percent,
            progress.completed,
            progress.total,
            quality.score,
            quality.label,
            confidence,
        );

        EvaluationResult {
            is_complete,
            confidence,
            quality: quality.score,
            quality_label: quality.label,
            should_continue: !is_complete,
            reasoning,
            recommendations,
            issues_found,
            improvement_suggestions,
            final_result: is_complete.then(|| result.to_string()),
            next_action: Some(next_action),
        }
    }
}

#[async_trait]
impl Evaluator for LexicalEvaluator {
    async fn evaluate(
        &self,
        plan: &Plan,
        result: &str,
        criteria: &EvaluationCriteria,
    ) -> EvaluationResult {
        self.assess(plan, result, criteria)
    }
}

fn criterion_covered(criterion: &str, evidence: &str, reports_success: bool) -> bool {
    if criterion.eq_ignore_ascii_case(DEFAULT_COMPLETION_CRITERION) {
        return reports_success;
    }
    let keywords: Vec<String> = criterion
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect();
    if keywords.is_empty() {
        return reports_success;
    }
    let hits = keywords.iter().filter(|k| evidence.contains(k.as_str())).count();
    hits * 2 >= keywords.len()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
