//! Plan and Step domain types.
//!
//! A plan is the ordered decomposition of a task. Steps are appended, never
//! removed; the cursor (`current_step_index`) only moves forward.

use serde::{Deserialize, Serialize};

/// One unit of delegated work with an expected outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,

    pub description: String,

    #[serde(default)]
    pub required_tools: Vec<String>,

    #[serde(default)]
    pub expected_outcome: String,

    #[serde(default)]
    pub is_complete: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Step {
    /// A pending step with no tools and no expected outcome.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            required_tools: Vec::new(),
            expected_outcome: String::new(),
            is_complete: false,
            result: None,
            reasoning: None,
        }
    }
}

/// An ordered decomposition of a task into steps plus completion criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,

    pub task: String,

    pub steps: Vec<Step>,

    pub completion_criteria: Vec<String>,

    pub estimated_iterations: u32,

    #[serde(default)]
    pub current_step_index: usize,
}

impl Plan {
    /// The step under the cursor, if any remain.
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    /// True once the cursor has moved past the last step.
    pub fn is_exhausted(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }

    /// Move the cursor forward by one. Never moves past `steps.len()`.
    /// Returns `true` if the cursor moved.
    pub fn advance(&mut self) -> bool {
        if self.current_step_index < self.steps.len() {
            self.current_step_index += 1;
            true
        } else {
            false
        }
    }

    /// Record the outcome of step `index` and mark it complete.
    ///
    /// Only the addressed step is touched. Returns `false` for an
    /// out-of-range index.
    pub fn mark_step_complete(
        &mut self,
        index: usize,
        result: impl Into<String>,
        reasoning: Option<String>,
    ) -> bool {
        match self.steps.get_mut(index) {
            Some(step) => {
                step.is_complete = true;
                step.result = Some(result.into());
                step.reasoning = reasoning;
                true
            }
            None => false,
        }
    }

    /// Append a step to the end of the plan.
    pub fn append_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn completed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_complete).count()
    }

    /// Completed steps as a percentage of all steps, in `[0, 100]`.
    pub fn progress_percent(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        (self.completed_count() as f64 / self.steps.len() as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(n: usize) -> Plan {
        Plan {
            id: "plan_test".into(),
            task: "test task".into(),
            steps: (1..=n)
                .map(|i| Step::new(format!("step_{i}"), format!("Step {i}")))
                .collect(),
            completion_criteria: vec!["done".into()],
            estimated_iterations: n as u32,
            current_step_index: 0,
        }
    }

    #[test]
    fn advance_is_bounded_by_step_count() {
        let mut plan = plan_with(2);
        assert!(plan.advance());
        assert!(plan.advance());
        assert!(!plan.advance());
        assert_eq!(plan.current_step_index, 2);
        assert!(plan.is_exhausted());
        assert!(plan.current_step().is_none());
    }

    #[test]
    fn mark_step_complete_touches_only_that_step() {
        let mut plan = plan_with(3);
        assert!(plan.mark_step_complete(1, "ok", Some("looked fine".into())));

        assert!(!plan.steps[0].is_complete);
        assert!(plan.steps[1].is_complete);
        assert!(!plan.steps[2].is_complete);
        assert_eq!(plan.steps[1].result.as_deref(), Some("ok"));
        assert_eq!(plan.steps[1].reasoning.as_deref(), Some("looked fine"));
    }

    #[test]
    fn mark_step_complete_out_of_range() {
        let mut plan = plan_with(1);
        assert!(!plan.mark_step_complete(5, "x", None));
        assert_eq!(plan.completed_count(), 0);
    }

    #[test]
    fn progress_percent_tracks_completion() {
        let mut plan = plan_with(4);
        assert_eq!(plan.progress_percent(), 0.0);
        plan.mark_step_complete(0, "a", None);
        assert!((plan.progress_percent() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let plan = plan_with(1);
        let json = serde_json::to_value(&plan).unwrap();
        assert!(json.get("completionCriteria").is_some());
        assert!(json.get("estimatedIterations").is_some());
        assert!(json["steps"][0].get("requiredTools").is_some());
        assert!(json["steps"][0].get("isComplete").is_some());
    }
}
