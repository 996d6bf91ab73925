//! `stepwise config` — Configuration management commands.

use std::path::Path;

use stepwise_config::EngineConfig;

use super::load_config;

pub fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match load_config(path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();
            if config.executor.max_tool_calls == 0 {
                warnings.push("executor.max_tool_calls is 0; tool calls will never run");
            }
            if config.evaluation.allow_partial_completion {
                warnings.push("Partial completion is accepted; tasks may finish early");
            }
            if config.max_iterations > 50 {
                warnings.push("max_iterations above 50 allows very long unattended runs");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Model:       {}", config.model);
            println!("   Endpoint:    {}", config.transport.url);
            println!("   Iterations:  {}", config.max_iterations);
            println!("   Step limit:  {}s", config.executor.step_timeout_secs);
            println!("   Tool cap:    {}", config.executor.max_tool_calls);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn path(path: Option<&Path>) {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| EngineConfig::config_dir().join("config.toml"));
    println!("{}", config_path.display());
}
