//! `stepwise plan` — Structure a raw planning response.

use std::io::Read;

use serde_json::Value;
use stepwise_agent::{extract_plan_json, structure_plan};
use stepwise_core::plan::Plan;

pub fn run(input: &str, task: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input).map_err(|e| format!("Failed to read {input}: {e}"))?
    };

    let plan = structure(&text, task);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

/// Structure `text`, which may be bare JSON or a reply with JSON inside it.
/// The task falls back to a `task` field in the response.
pub fn structure(text: &str, task: Option<&str>) -> Plan {
    let raw = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(_) => extract_plan_json(text),
    };
    let task = task
        .map(str::to_string)
        .or_else(|| raw.get("task").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    structure_plan(&raw, &task)
}
