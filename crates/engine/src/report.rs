//! Step, scenario and run results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::error::RunnerResult;

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed { reason: String },
    Errored { error: String },
    Skipped,
}

impl StepStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, StepStatus::Passed)
    }

    /// Failed or errored
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed { .. } | StepStatus::Errored { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Passed => "passed",
            StepStatus::Failed { .. } => "failed",
            StepStatus::Errored { .. } => "errored",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            StepStatus::Failed { reason } => Some(reason),
            StepStatus::Errored { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub name: String,
    #[serde(flatten)]
    pub status: StepStatus,
    /// Attempts made, counting retries and repeats
    pub attempts: u32,
    pub duration_ms: u64,
    /// Status codes of every HTTP response the step received
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extracted: BTreeMap<String, Value>,
}

impl StepResult {
    pub fn skipped(index: usize, name: String) -> Self {
        Self {
            index,
            name,
            status: StepStatus::Skipped,
            attempts: 0,
            duration_ms: 0,
            statuses: Vec::new(),
            extracted: BTreeMap::new(),
        }
    }
}

/// Lifecycle of a scenario run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Pending,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub status: ScenarioStatus,
    /// Final lifecycle state
    pub state: ScenarioState,
    /// Every state the scenario went through, in order
    pub transitions: Vec<ScenarioState>,
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown: Vec<StepResult>,
    pub duration_ms: u64,
    /// Resource release failures; they never change `status`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
}

impl ScenarioResult {
    /// Failed if any main step failed or errored
    pub fn status_of(steps: &[StepResult]) -> ScenarioStatus {
        if steps.iter().any(|s| s.status.is_failure()) {
            ScenarioStatus::Failed
        } else {
            ScenarioStatus::Passed
        }
    }

    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    /// First failing step, for one-line summaries
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.status.is_failure())
    }
}

/// Counts across a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub steps_passed: usize,
    pub steps_failed: usize,
    pub steps_errored: usize,
    pub steps_skipped: usize,
}

impl Summary {
    fn add(&mut self, result: &ScenarioResult) {
        self.total += 1;
        match result.status {
            ScenarioStatus::Passed => self.passed += 1,
            ScenarioStatus::Failed => self.failed += 1,
        }
        for step in &result.steps {
            match step.status {
                StepStatus::Passed => self.steps_passed += 1,
                StepStatus::Failed { .. } => self.steps_failed += 1,
                StepStatus::Errored { .. } => self.steps_errored += 1,
                StepStatus::Skipped => self.steps_skipped += 1,
            }
        }
    }
}

/// Final report of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub base_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub summary: Summary,
    pub scenarios: Vec<ScenarioResult>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.summary.failed == 0
    }

    /// Write `results.json` into `dir`
    pub fn write_json(&self, dir: &Path) -> RunnerResult<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join("results.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Append-only collector of scenario results
#[derive(Debug)]
pub struct Reporter {
    run_id: Uuid,
    base_url: String,
    started_at: DateTime<Utc>,
    results: Vec<ScenarioResult>,
    summary: Summary,
}

impl Reporter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            base_url: base_url.into(),
            started_at: Utc::now(),
            results: Vec::new(),
            summary: Summary::default(),
        }
    }

    pub fn record(&mut self, result: ScenarioResult) {
        self.summary.add(&result);
        self.results.push(result);
    }

    pub fn results(&self) -> &[ScenarioResult] {
        &self.results
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn finish(self) -> RunReport {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        RunReport {
            run_id: self.run_id,
            base_url: self.base_url,
            started_at: self.started_at,
            finished_at,
            duration_ms,
            summary: self.summary,
            scenarios: self.results,
        }
    }
}
