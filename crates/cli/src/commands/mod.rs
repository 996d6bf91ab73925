pub mod config_cmd;
pub mod evaluate;
pub mod plan;
pub mod run;

use std::path::Path;

use stepwise_config::{ConfigError, EngineConfig};

/// Load from `path` when given, otherwise from the default location with
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    }
}
