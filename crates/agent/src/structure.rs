//! Plan structuring — turns a loosely-typed planning response into a [`Plan`].
//!
//! Structuring is total: any JSON value, including `null`, yields a usable
//! plan with at least one step. Feeding a structured plan back through
//! [`structure_plan`] returns it unchanged.

use serde_json::Value;
use stepwise_core::plan::{Plan, Step};
use uuid::Uuid;

/// Criterion used when a planning response carries none.
pub const DEFAULT_COMPLETION_CRITERION: &str = "Task completed successfully";

/// Upper bound for `estimatedIterations`.
pub const MAX_ESTIMATED_ITERATIONS: u32 = 20;

/// Build a well-formed plan for `task` from a raw planning response.
///
/// Field handling:
/// - `id`: kept if it is a non-empty string, otherwise `plan_<uuid>`
/// - `steps[i].id` / `.description`: default to `step_<i+1>` / `Step <i+1>`
/// - `steps[i].requiredTools`: non-array becomes empty; non-string entries are dropped
/// - `steps[i].isComplete`: always `false`
/// - `estimatedIterations`: clamped to `[1, 20]`, defaulting to the step count
/// - `completionCriteria`: defaults to [`DEFAULT_COMPLETION_CRITERION`]
pub fn structure_plan(raw: &Value, task: &str) -> Plan {
    let mut steps: Vec<Step> = raw
        .get("steps")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .enumerate()
                .map(|(i, item)| structure_step(i, item))
                .collect()
        })
        .unwrap_or_default();

    if steps.is_empty() {
        steps.push(Step::new("step_1", task));
    }

    let estimated_iterations = raw
        .get("estimatedIterations")
        .and_then(as_integer)
        .unwrap_or(steps.len() as i64)
        .clamp(1, MAX_ESTIMATED_ITERATIONS as i64) as u32;

    let mut completion_criteria: Vec<String> = raw
        .get("completionCriteria")
        .and_then(Value::as_array)
        .map(|items| strings(items))
        .unwrap_or_default();
    if completion_criteria.is_empty() {
        completion_criteria.push(DEFAULT_COMPLETION_CRITERION.to_string());
    }

    let id = non_empty_str(raw.get("id"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("plan_{}", Uuid::new_v4().simple()));

    Plan {
        id,
        task: task.to_string(),
        steps,
        completion_criteria,
        estimated_iterations,
        current_step_index: 0,
    }
}

fn structure_step(index: usize, raw: &Value) -> Step {
    // A bare string is taken as the step description.
    if let Some(description) = non_empty_str(Some(raw)) {
        return Step::new(format!("step_{}", index + 1), description);
    }

    let id = non_empty_str(raw.get("id"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("step_{}", index + 1));
    let description = non_empty_str(raw.get("description"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("Step {}", index + 1));

    let mut step = Step::new(id, description);
    step.required_tools = raw
        .get("requiredTools")
        .and_then(Value::as_array)
        .map(|items| strings(items))
        .unwrap_or_default();
    step.expected_outcome = raw
        .get("expectedOutcome")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    step
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn strings(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|v| non_empty_str(Some(v)))
        .map(str::to_string)
        .collect()
}

fn as_integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}
