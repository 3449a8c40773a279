//! Error types for scenario execution

use thiserror::Error;

/// Failure of a single action.
///
/// These never escape the engine: every variant is converted into a step
/// result. `is_retryable` and `is_fatal` drive the retry and abort policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("element not found: {locator}")]
    ElementNotFound { locator: String },

    #[error("locator matched {matches} elements: {locator}")]
    AmbiguousLocator { locator: String, matches: usize },

    #[error("timed out after {timeout_ms} ms: {what}")]
    ActionTimeout { what: String, timeout_ms: u64 },

    #[error("condition not met within {timeout_ms} ms: {condition}")]
    ConditionTimedOut { condition: String, timeout_ms: u64 },

    #[error("interaction failed: {0}")]
    Interaction(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("no browser context available for '{0}'")]
    NoBrowser(String),

    #[error("cancelled")]
    Cancelled,
}

impl ActionError {
    /// Errors worth another attempt: the element may attach or become
    /// interactable a moment later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActionError::ElementNotFound { .. } | ActionError::ActionTimeout { .. }
        )
    }

    /// Errors that abort the scenario instead of failing the step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ActionError::Transport(_) | ActionError::Cancelled | ActionError::NoBrowser(_)
        )
    }
}

/// An expectation that did not hold. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct AssertionFailed(pub String);

/// Why a step did not pass
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Assertion(#[from] AssertionFailed),
}

/// Browser driver errors raised while launching or talking to the browser
/// process, outside of a single action.
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Node.js not found at '{0}'")]
    NodeNotFound(String),

    #[error("Playwright not installed. Install with: npm install playwright && npx playwright install")]
    PlaywrightNotFound,

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level errors. Only these can stop a whole run.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Scenario parse error in {path}: {reason}")]
    ScenarioParse { path: String, reason: String },

    #[error("Invalid scenario '{name}': {reason}")]
    InvalidScenario { name: String, reason: String },

    #[error("Resource acquisition failed for '{scenario}': {reason}")]
    ResourceAcquisition { scenario: String, reason: String },

    #[error("Target health check failed after {0} attempts")]
    HealthCheck(usize),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
