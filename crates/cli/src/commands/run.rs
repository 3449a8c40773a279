//! Run Command

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use stepwise_engine::{ExecutionEngine, FailureMode, PlaywrightDriver, Scenario};
use tracing::{info, warn};

use super::{ensure_selected, load_config, parse_var};
use crate::output::{print_info, print_report, print_warning, OutputFormat};

#[derive(Args)]
pub struct RunArgs {
    /// Scenario files or directories
    #[arg(default_value = "scenarios")]
    pub paths: Vec<PathBuf>,

    /// Base URL of the application under test
    #[arg(long, env = "STEPWISE_BASE_URL")]
    pub base_url: Option<String>,

    /// Scenario variable, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Only run scenarios carrying this tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Only run the scenario with this name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Scenarios to run concurrently
    #[arg(long)]
    pub lanes: Option<usize>,

    /// Keep running a scenario's steps after one fails
    #[arg(long)]
    pub collect_all: bool,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// Directory for results.json
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Keep scenarios matching the tag and name filters
pub fn select(scenarios: Vec<Scenario>, tag: Option<&str>, name: Option<&str>) -> Vec<Scenario> {
    scenarios
        .into_iter()
        .filter(|s| tag.map_or(true, |t| s.has_tag(t)))
        .filter(|s| name.map_or(true, |n| s.name == n))
        .collect()
}

/// Returns whether every scenario passed
pub async fn execute(args: RunArgs, config_path: &Path, format: OutputFormat) -> Result<bool> {
    let mut config = load_config(config_path, &args.vars)?;
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if let Some(lanes) = args.lanes {
        config.lanes = lanes;
    }
    if args.collect_all {
        config.failure_mode = FailureMode::CollectAll;
    }
    if args.headed {
        config.browser.headless = false;
    }
    if let Some(output) = args.output {
        config.output_dir = output;
    }

    let scenarios = Scenario::load_all(&args.paths).context("Failed to load scenarios")?;
    let scenarios = select(scenarios, args.tag.as_deref(), args.name.as_deref());
    ensure_selected(&scenarios, "the given filters")?;

    let mut engine = ExecutionEngine::new(config.clone())?;
    if scenarios.iter().any(Scenario::needs_browser) {
        info!("Launching {} browser", config.browser.engine.as_str());
        let driver = PlaywrightDriver::launch(&config.browser)
            .await
            .context("Failed to start the browser")?;
        engine = engine.with_browser(Arc::new(driver));
    }

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running scenarios");
            cancel.cancel();
        }
    });

    let report = engine.run(&scenarios).await;
    if let Err(e) = engine.shutdown().await {
        warn!("Browser shutdown failed: {}", e);
    }
    let report = report?;

    let path = report
        .write_json(&config.output_dir)
        .context("Failed to write results")?;
    print_report(&report, format);
    if matches!(format, OutputFormat::Table) {
        print_info(&format!("Results written to {}", path.display()));
    }
    if engine.cancellation_token().is_cancelled() {
        print_warning("Run was interrupted");
    }

    Ok(report.passed())
}
