//! Stepwise scenario engine
//!
//! Runs declarative, multi-step end-to-end scenarios against a web
//! application, driving both a real browser (Playwright) and its HTTP API:
//! - Parses YAML scenario files into ordered steps
//! - Gives every scenario a private session, HTTP client and browser context
//! - Retries flaky actions, polls conditions, checks expectations
//! - Releases every resource on every exit path and reports the results
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ExecutionEngine                         │
//! │    ├── preflight: wait_for_healthy(base_url + health_path)  │
//! │    ├── lanes: run_scenario() x N, results in order          │
//! │    └── Reporter -> RunReport -> results.json                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scenario (YAML)                                            │
//! │    ├── name, tags, vars, failure_mode                       │
//! │    ├── steps: [Step]                                        │
//! │    │     ├── navigate { url, wait_until }                   │
//! │    │     ├── click / fill { locator }                       │
//! │    │     ├── http { method, url, body, headers }            │
//! │    │     ├── sleep { ms }                                   │
//! │    │     ├── wait_for { until }                             │
//! │    │     └── expect / extract / repeat / retry              │
//! │    └── teardown: [Step]                                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioResources                                          │
//! │    ├── HttpSession (own cookie jar)                         │
//! │    └── BrowserContext (from a shared BrowserDriver)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod http;
pub mod locator;
pub mod report;
pub mod resources;
pub mod scenario;
pub mod session;
pub mod step;
pub mod template;

pub use action::{Action, ActionOutput, Condition};
pub use browser::{BrowserContext, BrowserDriver, PlaywrightDriver};
pub use config::{FailureMode, RetryPolicy, RunnerConfig};
pub use engine::ExecutionEngine;
pub use error::{ActionError, BrowserError, RunnerError, RunnerResult};
pub use locator::Locator;
pub use report::{Reporter, RunReport, ScenarioResult, ScenarioState, ScenarioStatus, StepResult, StepStatus};
pub use scenario::Scenario;
pub use session::Session;
pub use step::{Expectation, Extraction, Step};
