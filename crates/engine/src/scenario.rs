//! Scenario definitions loaded from YAML

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::FailureMode;
use crate::error::{RunnerError, RunnerResult};
use crate::session::RESERVED_VARIABLES;
use crate::step::{ExtractSource, Step};
use crate::template::referenced_variables;

/// Names every scenario can reference without declaring them

/// An ordered list of steps sharing one session
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Initial session variables
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    /// Overrides the run's failure mode
    #[serde(default)]
    pub failure_mode: Option<FailureMode>,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Always run after `steps`, before resources are released
    #[serde(default)]
    pub teardown: Vec<Step>,

    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tags: Vec::new(),
            vars: BTreeMap::new(),
            failure_mode: None,
            steps: Vec::new(),
            teardown: Vec::new(),
            source: None,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn teardown_step(mut self, step: Step) -> Self {
        self.teardown.push(step);
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = Some(mode);
        self
    }

    /// Parse a scenario; `origin` names the source in errors
    pub fn from_yaml(content: &str, origin: &str) -> RunnerResult<Self> {
        let scenario: Scenario =
            serde_yaml::from_str(content).map_err(|e| RunnerError::ScenarioParse {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;
        scenario.check_shape()?;
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> RunnerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut scenario = Self::from_yaml(&content, &path.display().to_string())?;
        scenario.source = Some(path.to_path_buf());
        Ok(scenario)
    }

    /// Load scenarios from files and directories (recursively, `*.yaml` /
    /// `*.yml`, sorted by path). Names must be unique across the set.
    pub fn load_all(paths: &[PathBuf]) -> RunnerResult<Vec<Self>> {
        let mut files = Vec::new();
        for path in paths {
            if path.is_dir() {
                let mut found: Vec<PathBuf> = WalkDir::new(path)
                    .into_iter()
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_type().is_file())
                    .map(|entry| entry.into_path())
                    .filter(|p| is_yaml(p))
                    .collect();
                found.sort();
                files.extend(found);
            } else if path.exists() {
                files.push(path.clone());
            } else {
                return Err(RunnerError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("scenario path not found: {}", path.display()),
                )));
            }
        }

        let mut seen = HashSet::new();
        let mut scenarios = Vec::with_capacity(files.len());
        for file in files {
            debug!("Loading scenario {}", file.display());
            let scenario = Self::from_file(&file)?;
            if !seen.insert(scenario.name.clone()) {
                return Err(RunnerError::InvalidScenario {
                    name: scenario.name,
                    reason: format!("duplicate scenario name (again in {})", file.display()),
                });
            }
            scenarios.push(scenario);
        }
        Ok(scenarios)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether any step needs a browser context
    pub fn needs_browser(&self) -> bool {
        self.steps
            .iter()
            .chain(self.teardown.iter())
            .any(|s| s.needs_browser())
    }

    pub fn effective_failure_mode(&self, default: FailureMode) -> FailureMode {
        self.failure_mode.unwrap_or(default)
    }

    fn check_shape(&self) -> RunnerResult<()> {
        let invalid = |reason: String| RunnerError::InvalidScenario {
            name: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if let Some(name) = self
            .vars
            .keys()
            .find(|name| RESERVED_VARIABLES.contains(&name.as_str()))
        {
            return Err(invalid(format!("variable '{name}' is reserved")));
        }
        for (index, step) in self.steps.iter().chain(self.teardown.iter()).enumerate() {
            if let Some(repeat) = step.repeat {
                if repeat.times == 0 {
                    return Err(invalid(format!("step {index}: repeat.times must be at least 1")));
                }
            }
            if let Some(retry) = step.retry {
                if retry.attempts == 0 {
                    return Err(invalid(format!("step {index}: retry.attempts must be at least 1")));
                }
            }
        }
        Ok(())
    }

    /// Template variables that are neither declared (by the scenario or in
    /// `known`) nor extracted by an earlier step. Teardown may use anything
    /// the main steps extract.
    pub fn undefined_variables(&self, known: &BTreeSet<String>) -> Vec<String> {
        let mut defined: BTreeSet<String> = known
            .iter()
            .cloned()
            .chain(self.vars.keys().cloned())
            .chain(RESERVED_VARIABLES.iter().map(|s| s.to_string()))
            .collect();
        let mut problems = Vec::new();

        let mut check = |step: &Step, label: &str, defined: &BTreeSet<String>| {
            let mut templates = step.action.templates();
            if let Some(expect) = &step.expect {
                templates.extend(expect.templates());
            }
            for extraction in &step.extract {
                if let ExtractSource::Text(locator) = &extraction.source {
                    templates.push(locator.to_string());
                }
            }
            for name in templates.iter().flat_map(|t| referenced_variables(t)) {
                if !defined.contains(&name) {
                    problems.push(format!("{label}: '{{{name}}}' is never declared or extracted"));
                }
            }
        };

        for (index, step) in self.steps.iter().enumerate() {
            check(step, &format!("step {} ({})", index + 1, step.label()), &defined);
            defined.extend(step.extract.iter().map(|e| e.name.clone()));
        }
        for (index, step) in self.teardown.iter().enumerate() {
            check(step, &format!("teardown {} ({})", index + 1, step.label()), &defined);
            defined.extend(step.extract.iter().map(|e| e.name.clone()));
        }

        problems.dedup();
        problems
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
