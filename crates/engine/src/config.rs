//! Runner configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RunnerError, RunnerResult};
use crate::session::RESERVED_VARIABLES;

/// Prefix for environment variables that seed session variables
/// (`STEPWISE_VAR_PROVIDER_EMAIL` -> `provider_email`).
pub const VAR_ENV_PREFIX: &str = "STEPWISE_VAR_";

/// Environment variable overriding the target base URL
pub const BASE_URL_ENV: &str = "STEPWISE_BASE_URL";

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Base URL of the application under test
    pub base_url: String,

    /// Number of scenarios executed concurrently
    pub lanes: usize,

    /// What to do after a failed step
    pub failure_mode: FailureMode,

    /// Default timeouts
    pub timeouts: TimeoutConfig,

    /// Retry policy for flaky actions
    pub retry: RetryPolicy,

    /// Browser configuration
    pub browser: BrowserConfig,

    /// Target health check run before the first scenario
    pub preflight: PreflightConfig,

    /// Directory for results
    pub output_dir: PathBuf,

    /// Credentials and fixed inputs, visible to every scenario as variables
    pub variables: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            lanes: 1,
            failure_mode: FailureMode::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryPolicy::default(),
            browser: BrowserConfig::default(),
            preflight: PreflightConfig::default(),
            output_dir: PathBuf::from("test-results"),
            variables: BTreeMap::new(),
        }
    }
}

/// Failure handling after a step fails its expectation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Abort the scenario on the first failed step
    #[default]
    ShortCircuit,
    /// Record the failure and keep going
    CollectAll,
}

/// Timeout configuration, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub navigation_ms: u64,
    pub action_ms: u64,
    pub http_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            navigation_ms: 10_000,
            action_ms: 5_000,
            http_ms: 30_000,
            poll_interval_ms: 250,
        }
    }
}

/// Bounded retry with fixed backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Browser engine used by the Playwright bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserEngine {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserEngine::Chromium => "chromium",
            BrowserEngine::Firefox => "firefox",
            BrowserEngine::Webkit => "webkit",
        }
    }
}

/// How a locator matching several elements is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorPolicy {
    /// Take the first match in document order
    #[default]
    First,
    /// Fail with `AmbiguousLocator`
    Strict,
}

impl LocatorPolicy {
    pub fn is_strict(&self) -> bool {
        matches!(self, LocatorPolicy::Strict)
    }
}

/// Browser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub engine: BrowserEngine,
    pub headless: bool,

    /// Node.js binary running the Playwright bridge
    pub node: String,

    pub locator_policy: LocatorPolicy,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: BrowserEngine::Chromium,
            headless: true,
            node: "node".to_string(),
            locator_policy: LocatorPolicy::First,
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

/// Target health check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    /// Path polled before the run (None = skip)
    pub health_path: Option<String>,
    pub timeout_ms: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            health_path: None,
            timeout_ms: 30_000,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> RunnerResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> RunnerResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STEPWISE_BASE_URL` and `STEPWISE_VAR_*` from the process environment
    pub fn apply_env(&mut self) {
        self.apply_vars(std::env::vars());
    }

    fn apply_vars(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            if key == BASE_URL_ENV {
                self.base_url = value;
            } else if let Some(name) = key.strip_prefix(VAR_ENV_PREFIX) {
                if !name.is_empty() {
                    self.variables.insert(name.to_lowercase(), value);
                }
            }
        }
    }

    /// Check values the engine cannot run with
    pub fn validate(&self) -> RunnerResult<()> {
        if self.lanes == 0 {
            return Err(RunnerError::Config("lanes must be at least 1".into()));
        }
        if self.retry.attempts == 0 {
            return Err(RunnerError::Config("retry.attempts must be at least 1".into()));
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err(RunnerError::Config(
                "timeouts.poll_interval_ms must be positive".into(),
            ));
        }
        if let Some(name) = self
            .variables
            .keys()
            .find(|name| RESERVED_VARIABLES.contains(&name.as_str()))
        {
            return Err(RunnerError::Config(format!(
                "variable '{name}' is reserved and cannot be set"
            )));
        }
        reqwest::Url::parse(&self.base_url).map_err(|e| {
            RunnerError::Config(format!("invalid base_url '{}': {}", self.base_url, e))
        })?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.poll_interval_ms)
    }
}
