//! `stepwise evaluate` — Score a step result against a plan.

use std::path::Path;

use serde_json::Value;
use stepwise_agent::{Evaluator, LexicalEvaluator, structure_plan};
use stepwise_core::plan::Plan;

use super::load_config;

pub async fn run(
    config_path: Option<&Path>,
    plan_path: &Path,
    result: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path).map_err(|e| format!("Failed to load config: {e}"))?;
    let text = std::fs::read_to_string(plan_path)
        .map_err(|e| format!("Failed to read {}: {e}", plan_path.display()))?;
    let plan = load_plan(&serde_json::from_str(&text)?);

    let verdict = LexicalEvaluator::new()
        .evaluate(&plan, result, &config.evaluation.criteria())
        .await;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

/// Accept either a saved plan (with progress) or a raw planning response.
fn load_plan(value: &Value) -> Plan {
    serde_json::from_value::<Plan>(value.clone()).unwrap_or_else(|_| {
        let task = value.get("task").and_then(Value::as_str).unwrap_or_default();
        structure_plan(value, task)
    })
}
