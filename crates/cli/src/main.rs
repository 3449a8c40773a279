//! Stepwise CLI - Main Entry Point
//!
//! Runs, lists and validates end-to-end scenarios.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{list, run, validate};
use output::{LogFormat, OutputFormat};

/// Exit code when every scenario passed
const EXIT_PASSED: i32 = 0;
/// Exit code when at least one scenario failed
const EXIT_FAILED: i32 = 1;
/// Exit code when the run itself could not complete
const EXIT_ERROR: i32 = 2;

/// Stepwise - browser and HTTP scenario runner
#[derive(Parser)]
#[command(name = "stepwise")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "stepwise.toml", global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios against an application
    Run(run::RunArgs),

    /// List scenarios without running them
    List(list::ListArgs),

    /// Parse scenarios and check their variables
    Validate(validate::ValidateArgs),
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let outcome = match cli.command {
        Commands::Run(args) => run::execute(args, &cli.config, cli.format).await,
        Commands::List(args) => list::execute(args, cli.format),
        Commands::Validate(args) => validate::execute(args, &cli.config),
    };

    let code = match outcome {
        Ok(true) => EXIT_PASSED,
        Ok(false) => EXIT_FAILED,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}
