//! Execution engine
//!
//! Each scenario moves `Pending -> Running -> {Completed, Aborted}`:
//!
//! ```text
//!   acquire resources ──► steps (in order) ──► teardown ──► release
//!        │                    │ errored / short-circuit        ▲
//!        │                    └─────────► remaining Skipped ───┘
//!        └── failure aborts the whole run
//! ```
//!
//! Release runs on every exit path: normal completion, abort, a panicking
//! step, and cancellation.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::action::{Action, ActionContext, ActionOutput};
use crate::browser::{BrowserDriver, ContextOptions};
use crate::config::{FailureMode, RetryPolicy, RunnerConfig};
use crate::error::{ActionError, RunnerError, RunnerResult, StepError};
use crate::health;
use crate::report::{
    Reporter, RunReport, ScenarioResult, ScenarioState, StepResult, StepStatus,
};
use crate::resources::{ResourceTracker, ScenarioResources};
use crate::scenario::Scenario;
use crate::session::Session;
use crate::step::Step;
use crate::template::Renderer;

/// Slack on top of an action's own budget before the engine gives up on it
const WATCHDOG_GRACE: Duration = Duration::from_secs(5);

/// Runs scenarios and collects their results
pub struct ExecutionEngine {
    config: RunnerConfig,
    browser: Option<Arc<dyn BrowserDriver>>,
    tracker: ResourceTracker,
    cancel: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(config: RunnerConfig) -> RunnerResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            browser: None,
            tracker: ResourceTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Use `driver` for scenarios that need a browser
    pub fn with_browser(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.browser = Some(driver);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Cancelling this token aborts the current action of every lane
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// HTTP sessions and browser contexts currently open
    pub fn open_handles(&self) -> usize {
        self.tracker.open_handles()
    }

    /// Stop the browser driver, if any
    pub async fn shutdown(&self) -> RunnerResult<()> {
        if let Some(driver) = &self.browser {
            driver.shutdown().await?;
        }
        Ok(())
    }

    /// Run every scenario, `lanes` at a time. Results keep declaration order.
    pub async fn run(&self, scenarios: &[Scenario]) -> RunnerResult<RunReport> {
        if let Some(path) = &self.config.preflight.health_path {
            health::wait_for_healthy(
                &self.config.base_url,
                path,
                Duration::from_millis(self.config.preflight.timeout_ms),
            )
            .await?;
        }

        let mut reporter = Reporter::new(&self.config.base_url);
        info!(
            "Running {} scenario(s) on {} lane(s)",
            scenarios.len(),
            self.config.lanes
        );

        let mut results = stream::iter(scenarios)
            .map(|scenario| self.run_scenario(scenario))
            .buffered(self.config.lanes);

        while let Some(result) = results.next().await {
            let result = result?;
            if result.passed() {
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                let reason = result
                    .first_failure()
                    .and_then(|s| s.status.detail())
                    .unwrap_or("unknown error");
                error!("✗ {} - {}", result.name, reason);
            }
            reporter.record(result);
        }

        let report = reporter.finish();
        info!(
            "Results: {} passed, {} failed ({} ms)",
            report.summary.passed, report.summary.failed, report.duration_ms
        );
        Ok(report)
    }

    /// Run one scenario with fresh resources. Only resource acquisition
    /// failures are returned as errors.
    pub async fn run_scenario(&self, scenario: &Scenario) -> RunnerResult<ScenarioResult> {
        let span = info_span!("scenario", name = %scenario.name);
        self.execute(scenario).instrument(span).await
    }

    async fn execute(&self, scenario: &Scenario) -> RunnerResult<ScenarioResult> {
        let started = Instant::now();
        let mut transitions = vec![ScenarioState::Pending];

        let mut session = Session::new(&self.config.base_url);
        let mut vars = self.config.variables.clone();
        vars.extend(scenario.vars.clone());
        for (name, value) in vars {
            session
                .declare(&name, value)
                .map_err(|reason| RunnerError::InvalidScenario {
                    name: scenario.name.clone(),
                    reason,
                })?;
        }

        let options = scenario.needs_browser().then(|| self.context_options());
        let resources = ScenarioResources::acquire(
            &scenario.name,
            self.browser.as_ref(),
            options.as_ref(),
            &self.tracker,
        )
        .await?;
        transitions.push(ScenarioState::Running);
        debug!("Session {} running {} step(s)", session.id(), scenario.steps.len());

        let mode = scenario.effective_failure_mode(self.config.failure_mode);
        let mut steps = Vec::with_capacity(scenario.steps.len());
        let aborted = self
            .run_steps(&scenario.steps, mode, &mut session, &resources, &mut steps)
            .await;

        let mut teardown = Vec::with_capacity(scenario.teardown.len());
        if self.cancel.is_cancelled() {
            teardown.extend(
                scenario
                    .teardown
                    .iter()
                    .enumerate()
                    .map(|(index, step)| StepResult::skipped(index, step.label())),
            );
        } else if !scenario.teardown.is_empty() {
            let span = info_span!("teardown");
            self.run_steps(
                &scenario.teardown,
                FailureMode::CollectAll,
                &mut session,
                &resources,
                &mut teardown,
            )
            .instrument(span)
            .await;
        }

        let cleanup_errors = resources.release().await;

        let state = if aborted {
            ScenarioState::Aborted
        } else {
            ScenarioState::Completed
        };
        transitions.push(state);

        let status = ScenarioResult::status_of(&steps);
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(?status, ?state, duration_ms, "Scenario finished");

        Ok(ScenarioResult {
            name: scenario.name.clone(),
            status,
            state,
            transitions,
            steps,
            teardown,
            duration_ms,
            cleanup_errors,
        })
    }

    fn context_options(&self) -> ContextOptions {
        ContextOptions {
            viewport_width: self.config.browser.viewport_width,
            viewport_height: self.config.browser.viewport_height,
            default_timeout: Duration::from_millis(self.config.timeouts.action_ms),
            locator_policy: self.config.browser.locator_policy,
        }
    }

    /// Run `steps` in order, appending to `results`. Returns whether the
    /// sequence was aborted. A panicking step is recorded as errored.
    async fn run_steps(
        &self,
        steps: &[Step],
        mode: FailureMode,
        session: &mut Session,
        resources: &ScenarioResources,
        results: &mut Vec<StepResult>,
    ) -> bool {
        let outcome = AssertUnwindSafe(self.run_steps_unguarded(steps, mode, session, resources, results))
            .catch_unwind()
            .await;

        match outcome {
            Ok(aborted) => aborted,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                let index = results.len();
                error!("Step {} panicked: {}", index, message);
                if let Some(step) = steps.get(index) {
                    results.push(StepResult {
                        index,
                        name: step.label(),
                        status: StepStatus::Errored {
                            error: format!("panicked: {message}"),
                        },
                        attempts: 1,
                        duration_ms: 0,
                        statuses: Vec::new(),
                        extracted: BTreeMap::new(),
                    });
                }
                results.extend(
                    steps
                        .iter()
                        .enumerate()
                        .skip(index + 1)
                        .map(|(i, step)| StepResult::skipped(i, step.label())),
                );
                true
            }
        }
    }

    async fn run_steps_unguarded(
        &self,
        steps: &[Step],
        mode: FailureMode,
        session: &mut Session,
        resources: &ScenarioResources,
        results: &mut Vec<StepResult>,
    ) -> bool {
        let mut aborted = false;
        for (index, step) in steps.iter().enumerate() {
            if aborted {
                results.push(StepResult::skipped(index, step.label()));
                continue;
            }

            let span = info_span!("step", index, name = %step.label());
            let result = self
                .run_step(index, step, session, resources)
                .instrument(span)
                .await;

            match &result.status {
                StepStatus::Errored { .. } => aborted = true,
                StepStatus::Failed { .. } if mode == FailureMode::ShortCircuit => aborted = true,
                _ => {}
            }
            results.push(result);
        }
        aborted
    }

    async fn run_step(
        &self,
        index: usize,
        step: &Step,
        session: &mut Session,
        resources: &ScenarioResources,
    ) -> StepResult {
        let started = Instant::now();
        let mut attempts = 0;
        let mut statuses = Vec::new();
        let mut extracted = BTreeMap::new();

        let outcome = self
            .execute_step(
                step,
                session,
                resources,
                &mut attempts,
                &mut statuses,
                &mut extracted,
            )
            .await;

        let status = match outcome {
            Ok(()) => StepStatus::Passed,
            Err(StepError::Assertion(failed)) => StepStatus::Failed { reason: failed.0 },
            Err(StepError::Action(e)) if e.is_fatal() => StepStatus::Errored {
                error: e.to_string(),
            },
            Err(StepError::Action(e)) => StepStatus::Failed {
                reason: e.to_string(),
            },
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match &status {
            StepStatus::Passed => debug!(attempts, duration_ms, "Step passed"),
            StepStatus::Failed { reason } => warn!(attempts, duration_ms, "Step failed: {}", reason),
            StepStatus::Errored { error } => error!(attempts, duration_ms, "Step errored: {}", error),
            StepStatus::Skipped => {}
        }

        StepResult {
            index,
            name: step.label(),
            status,
            attempts,
            duration_ms,
            statuses,
            extracted,
        }
    }

    async fn execute_step(
        &self,
        step: &Step,
        session: &mut Session,
        resources: &ScenarioResources,
        attempts: &mut u32,
        statuses: &mut Vec<u16>,
        extracted: &mut BTreeMap<String, Value>,
    ) -> Result<(), StepError> {
        let policy = step.retry.unwrap_or(self.config.retry);
        let mut outputs = Vec::with_capacity(step.times() as usize);

        for round in 0..step.times() {
            if round > 0 {
                if let Some(repeat) = step.repeat {
                    self.pause(repeat.interval()).await?;
                }
            }
            let ctx = ActionContext {
                session: &*session,
                http: resources.http(),
                browser: resources.browser(),
                timeouts: &self.config.timeouts,
            };
            let output = self
                .perform_with_retry(&step.action, &ctx, policy, attempts)
                .await?;
            statuses.extend(output.statuses());
            outputs.push(output);
        }

        let output = if step.repeat.is_some() {
            ActionOutput::Batch(outputs)
        } else {
            outputs.pop().unwrap_or(ActionOutput::None)
        };

        if let Some(expect) = &step.expect {
            let renderer = Renderer::new(&*session);
            expect.evaluate(&output, &renderer)?;
        }

        let timeout = Duration::from_millis(self.config.timeouts.action_ms);
        for extraction in &step.extract {
            let value = extraction
                .apply(&output, resources.browser(), timeout)
                .await?;
            if extraction.auth {
                session.set_auth_token(match &value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
            debug!("Extracted {} = {}", extraction.name, value);
            session.extract(&extraction.name, value.clone());
            extracted.insert(extraction.name.clone(), value);
        }

        Ok(())
    }

    /// Retry retryable failures with a fixed backoff
    async fn perform_with_retry(
        &self,
        action: &Action,
        ctx: &ActionContext<'_>,
        policy: RetryPolicy,
        attempts: &mut u32,
    ) -> Result<ActionOutput, ActionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            *attempts += 1;

            let result = self
                .guarded(action.perform(ctx), action.budget(&self.config.timeouts))
                .await;
            match result {
                Err(e) if e.is_retryable() && attempt < policy.attempts => {
                    warn!(
                        attempt,
                        "{} failed: {}; retrying in {:?}",
                        action.describe(),
                        e,
                        policy.backoff()
                    );
                    self.pause(policy.backoff()).await?;
                }
                other => return other,
            }
        }
    }

    /// Race an action against cancellation and a watchdog
    async fn guarded<F>(&self, action: F, budget: Duration) -> Result<ActionOutput, ActionError>
    where
        F: Future<Output = Result<ActionOutput, ActionError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(ActionError::Cancelled);
        }
        let limit = budget + WATCHDOG_GRACE;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ActionError::Cancelled),
            result = tokio::time::timeout(limit, action) => match result {
                Ok(result) => result,
                Err(_) => Err(ActionError::ActionTimeout {
                    what: "action did not return".to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), ActionError> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ActionError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Expectation;

    fn config() -> RunnerConfig {
        RunnerConfig {
            retry: RetryPolicy {
                attempts: 2,
                backoff_ms: 10,
            },
            ..RunnerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_zero_step_scenario_completes() {
        let engine = ExecutionEngine::new(config()).unwrap();
        let result = engine.run_scenario(&Scenario::new("empty")).await.unwrap();

        assert!(result.passed());
        assert!(result.steps.is_empty());
        assert_eq!(
            result.transitions,
            vec![
                ScenarioState::Pending,
                ScenarioState::Running,
                ScenarioState::Completed
            ]
        );
        assert_eq!(engine.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_sleep_then_assertion_without_response_fails() {
        let engine = ExecutionEngine::new(config()).unwrap();
        let scenario = Scenario::new("sleep")
            .step(Step::new(Action::Sleep { ms: 5 }))
            .step(Step::new(Action::Sleep { ms: 5 }).expect(Expectation::status(&[200])))
            .step(Step::new(Action::Sleep { ms: 5 }));

        let result = engine.run_scenario(&scenario).await.unwrap();
        assert!(!result.passed());
        assert_eq!(result.state, ScenarioState::Aborted);
        assert!(result.steps[0].status.is_passed());
        assert!(matches!(result.steps[1].status, StepStatus::Failed { .. }));
        assert_eq!(result.steps[2].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let engine = ExecutionEngine::new(config()).unwrap();
        engine.cancellation_token().cancel();
        let scenario = Scenario::new("cancelled")
            .step(Step::new(Action::Sleep { ms: 10_000 }))
            .step(Step::new(Action::Sleep { ms: 1 }));

        let result = engine.run_scenario(&scenario).await.unwrap();
        assert_eq!(
            result.steps[0].status,
            StepStatus::Errored {
                error: "cancelled".into()
            }
        );
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert_eq!(result.state, ScenarioState::Aborted);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
