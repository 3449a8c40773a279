//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use serde::Serialize;
use stepwise_engine::{RunReport, ScenarioResult, StepStatus};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Log line format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No scenarios found.");
                return;
            }
            let mut table = new_table();
            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
    }
}

fn status_cell(status: &StepStatus) -> Cell {
    let color = match status {
        StepStatus::Passed => Color::Green,
        StepStatus::Failed { .. } => Color::Red,
        StepStatus::Errored { .. } => Color::Magenta,
        StepStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.label()).fg(color)
}

fn scenario_table(result: &ScenarioResult) -> Table {
    let mut table = new_table();
    table.set_header(vec!["#", "Step", "Status", "Attempts", "Duration", "Detail"]);
    let rows = result
        .steps
        .iter()
        .map(|s| (s, ""))
        .chain(result.teardown.iter().map(|s| (s, "teardown: ")));
    for (step, prefix) in rows {
        let mut detail = step.status.detail().unwrap_or_default().to_string();
        if detail.is_empty() && !step.statuses.is_empty() {
            detail = format_statuses(&step.statuses);
        }
        table.add_row(vec![
            Cell::new(step.index + 1),
            Cell::new(format!("{}{}", prefix, step.name)),
            status_cell(&step.status),
            Cell::new(step.attempts),
            Cell::new(format!("{}ms", step.duration_ms)),
            Cell::new(detail),
        ]);
    }
    table
}

/// Collapse runs of equal statuses: `200 x5, 429 x15`
fn format_statuses(statuses: &[u16]) -> String {
    let mut runs: Vec<(u16, usize)> = Vec::new();
    for status in statuses {
        match runs.last_mut() {
            Some((last, count)) if last == status => *count += 1,
            _ => runs.push((*status, 1)),
        }
    }
    runs.iter()
        .map(|(status, count)| {
            if *count == 1 {
                status.to_string()
            } else {
                format!("{} x{}", status, count)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Print a finished run
pub fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
        OutputFormat::Table => {
            for result in &report.scenarios {
                let verdict = if result.passed() {
                    "PASSED".green().bold()
                } else {
                    "FAILED".red().bold()
                };
                println!();
                println!(
                    "{} {} ({}ms, {:?})",
                    verdict,
                    result.name.bold(),
                    result.duration_ms,
                    result.state
                );
                println!("{}", scenario_table(result));
                for err in &result.cleanup_errors {
                    print_warning(&format!("cleanup: {}", err));
                }
            }

            let s = &report.summary;
            println!();
            let line = format!(
                "{} scenario(s): {} passed, {} failed | steps: {} passed, {} failed, {} errored, {} skipped | {}ms",
                s.total,
                s.passed,
                s.failed,
                s.steps_passed,
                s.steps_failed,
                s.steps_errored,
                s.steps_skipped,
                report.duration_ms
            );
            if report.passed() {
                print_success(&line);
            } else {
                print_error(&line);
            }
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}
