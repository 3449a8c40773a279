//! List Command

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use stepwise_engine::Scenario;

use super::run::select;
use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ListArgs {
    /// Scenario files or directories
    #[arg(default_value = "scenarios")]
    pub paths: Vec<PathBuf>,

    /// Only list scenarios carrying this tag
    #[arg(short, long)]
    pub tag: Option<String>,
}

#[derive(Serialize)]
pub struct ScenarioDisplay {
    pub name: String,
    pub tags: Vec<String>,
    pub steps: usize,
    pub teardown: usize,
    pub browser: bool,
    pub source: Option<String>,
}

impl From<&Scenario> for ScenarioDisplay {
    fn from(scenario: &Scenario) -> Self {
        Self {
            name: scenario.name.clone(),
            tags: scenario.tags.clone(),
            steps: scenario.steps.len(),
            teardown: scenario.teardown.len(),
            browser: scenario.needs_browser(),
            source: scenario.source.as_ref().map(|p| p.display().to_string()),
        }
    }
}

impl TableDisplay for ScenarioDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Tags", "Steps", "Teardown", "Browser", "Source"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.tags.join(", "),
            self.steps.to_string(),
            self.teardown.to_string(),
            if self.browser { "✓" } else { "" }.to_string(),
            self.source.clone().unwrap_or_default(),
        ]
    }
}

pub fn execute(args: ListArgs, format: OutputFormat) -> Result<bool> {
    let scenarios = Scenario::load_all(&args.paths).context("Failed to load scenarios")?;
    let scenarios = select(scenarios, args.tag.as_deref(), None);
    let rows: Vec<ScenarioDisplay> = scenarios.iter().map(ScenarioDisplay::from).collect();
    print_list(&rows, format);
    Ok(true)
}
