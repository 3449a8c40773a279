//! Validate Command

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use stepwise_engine::Scenario;

use super::{load_config, parse_var};
use crate::output::{print_error, print_success};

#[derive(Args)]
pub struct ValidateArgs {
    /// Scenario files or directories
    #[arg(default_value = "scenarios")]
    pub paths: Vec<PathBuf>,

    /// Variable that will be supplied at run time, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
}

/// Every variable reference that nothing defines, as `scenario: message` lines
pub fn problems(scenarios: &[Scenario], known: &BTreeSet<String>) -> Vec<String> {
    scenarios
        .iter()
        .flat_map(|s| {
            s.undefined_variables(known)
                .into_iter()
                .map(move |p| format!("{}: {}", s.name, p))
        })
        .collect()
}

/// Returns false when any scenario references an undefined variable
pub fn execute(args: ValidateArgs, config_path: &Path) -> Result<bool> {
    let config = load_config(config_path, &args.vars)?;
    let scenarios = Scenario::load_all(&args.paths).context("Failed to load scenarios")?;
    let known: BTreeSet<String> = config.variables.keys().cloned().collect();

    let problems = problems(&scenarios, &known);
    if problems.is_empty() {
        print_success(&format!("{} scenario(s) valid", scenarios.len()));
        return Ok(true);
    }
    for problem in &problems {
        print_error(problem);
    }
    Ok(false)
}
