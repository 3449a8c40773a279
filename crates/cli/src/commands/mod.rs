//! CLI Commands

use std::path::Path;

use anyhow::{bail, Context, Result};
use stepwise_engine::RunnerConfig;

pub mod list;
pub mod run;
pub mod validate;

/// Parse a `KEY=VALUE` pair given to `--var`
pub fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Load the config file, then let the environment and `--var` flags override it
pub fn load_config(path: &Path, vars: &[(String, String)]) -> Result<RunnerConfig> {
    let mut config = RunnerConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env();
    for (key, value) in vars {
        config.variables.insert(key.clone(), value.clone());
    }
    Ok(config)
}

/// Fail when a filter left nothing to do
pub fn ensure_selected<T>(items: &[T], what: &str) -> Result<()> {
    if items.is_empty() {
        bail!("No scenarios matched {}", what);
    }
    Ok(())
}
