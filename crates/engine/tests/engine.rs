//! Engine properties: isolation, ordering, release, failure modes, retries
//! and cancellation

mod common;

use serde_json::json;
use std::time::Duration;

use common::{closed_port, init_tracing, FakeApp, FakeBrowser};
use stepwise_engine::action::Condition;
use stepwise_engine::browser::LoadState;
use stepwise_engine::http::HttpMethod;
use stepwise_engine::{
    Action, ExecutionEngine, Expectation, Extraction, FailureMode, Locator, RetryPolicy,
    RunnerConfig, Scenario, ScenarioState, Step, StepStatus,
};

fn config(base_url: &str) -> RunnerConfig {
    RunnerConfig {
        base_url: base_url.to_string(),
        retry: RetryPolicy {
            attempts: 3,
            backoff_ms: 10,
        },
        ..RunnerConfig::default()
    }
}

fn http(method: HttpMethod, url: &str, body: Option<serde_json::Value>) -> Step {
    Step::new(Action::Http {
        method,
        url: url.to_string(),
        body,
        headers: Default::default(),
        timeout_ms: Some(2_000),
        require_json: false,
    })
}

fn get(url: &str) -> Step {
    http(HttpMethod::Get, url, None)
}

fn navigate(url: &str) -> Step {
    Step::new(Action::Navigate {
        url: url.to_string(),
        wait_until: LoadState::DomContentLoaded,
        timeout_ms: None,
    })
}

fn click(locator: Locator) -> Step {
    Step::new(Action::Click {
        locator,
        timeout_ms: None,
    })
}

fn login_as(user: &str) -> Scenario {
    Scenario::new(format!("login-{user}"))
        .var("user", user)
        .step(
            http(
                HttpMethod::Post,
                "/api/auth/login",
                Some(json!({"username": "{user}"})),
            )
            .expect(Expectation::status(&[200]))
            .extract(Extraction::json("token", &["/token"]).as_auth()),
        )
        .step(Step::new(Action::Sleep { ms: 20 }))
        .step(
            get("/api/whoami")
                .expect(
                    Expectation::status(&[200])
                        .with_json("/bearer", json!("token-{user}"))
                        .with_json("/cookie", json!("token-{user}")),
                )
                .extract(Extraction::json("me", &["/bearer"])),
        )
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    init_tracing();
    let app = FakeApp::spawn().await;
    let engine = ExecutionEngine::new(config(&app.base_url)).unwrap();

    let report = engine.run(&[login_as("alice"), login_as("bob")]).await.unwrap();

    assert!(report.passed(), "{:#?}", report.scenarios);
    assert_eq!(report.scenarios[0].steps[2].extracted["me"], json!("token-alice"));
    assert_eq!(report.scenarios[1].steps[2].extracted["me"], json!("token-bob"));
}

#[tokio::test]
async fn test_sessions_are_isolated_on_parallel_lanes() {
    let app = FakeApp::spawn().await;
    let mut config = config(&app.base_url);
    config.lanes = 2;
    let engine = ExecutionEngine::new(config).unwrap();

    let scenarios: Vec<Scenario> = ["ana", "beto", "carla", "dario"]
        .iter()
        .map(|user| login_as(user))
        .collect();
    let report = engine.run(&scenarios).await.unwrap();

    assert!(report.passed(), "{:#?}", report.scenarios);
    let names: Vec<_> = report.scenarios.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["login-ana", "login-beto", "login-carla", "login-dario"]);
}

#[tokio::test]
async fn test_a_scenario_without_login_sees_no_token() {
    let app = FakeApp::spawn().await;
    let engine = ExecutionEngine::new(config(&app.base_url)).unwrap();

    let anonymous = Scenario::new("anonymous").step(get("/api/whoami").expect(Expectation::status(&[401])));
    let report = engine.run(&[login_as("alice"), anonymous]).await.unwrap();

    assert!(report.passed(), "{:#?}", report.scenarios);
}

#[tokio::test]
async fn test_steps_run_in_declaration_order() {
    let app = FakeApp::spawn().await;
    let browser = FakeBrowser::new();
    let engine = ExecutionEngine::new(config(&app.base_url))
        .unwrap()
        .with_browser(browser.driver());

    let scenario = Scenario::new("ordered")
        .step(navigate("/login"))
        .step(Step::new(Action::Fill {
            locator: Locator::label("Email"),
            value: "provider@example.com".into(),
            timeout_ms: None,
        }))
        .step(click(Locator::role("button", Some("Ingresar"))))
        .step(get("/api/visit-types"))
        .step(click(Locator::text("Mis turnos")));

    let result = engine.run_scenario(&scenario).await.unwrap();
    assert!(result.passed(), "{:#?}", result.steps);

    let ops = browser.ops();
    assert_eq!(
        ops,
        vec![
            format!("ctx-1 navigate {}/login", app.base_url),
            "ctx-1 fill label=Email provider@example.com".to_string(),
            "ctx-1 click role=button[Ingresar]".to_string(),
            "ctx-1 click text=Mis turnos".to_string(),
            "ctx-1 close".to_string(),
        ]
    );
    assert_eq!(app.requests(), vec!["GET /api/visit-types".to_string()]);
}

#[tokio::test]
async fn test_transport_error_still_releases_everything() {
    let browser = FakeBrowser::new();
    let base_url = format!("http://127.0.0.1:{}", closed_port());
    let engine = ExecutionEngine::new(config(&base_url))
        .unwrap()
        .with_browser(browser.driver());

    let scenario = Scenario::new("unreachable")
        .step(navigate("/"))
        .step(get("/api/health"))
        .step(click(Locator::text("never")));

    let result = engine.run_scenario(&scenario).await.unwrap();

    assert_eq!(result.state, ScenarioState::Aborted);
    assert!(result.steps[0].status.is_passed());
    assert!(
        matches!(&result.steps[1].status, StepStatus::Errored { error } if error.contains("transport")),
        "{:?}",
        result.steps[1].status
    );
    assert_eq!(result.steps[2].status, StepStatus::Skipped);

    assert_eq!(browser.contexts_created(), 1);
    assert_eq!(browser.open_contexts(), 0);
    assert_eq!(engine.open_handles(), 0);
    assert!(result.cleanup_errors.is_empty());
}

#[tokio::test]
async fn test_short_circuit_and_collect_all() {
    let app = FakeApp::spawn().await;
    let engine = ExecutionEngine::new(config(&app.base_url)).unwrap();

    let scenario = Scenario::new("two-failures")
        .step(get("/api/appointments/999").expect(Expectation::status(&[200])))
        .step(get("/api/visit-types").expect(Expectation::status(&[200])))
        .step(get("/api/appointments/998").expect(Expectation::status(&[200])));

    let result = engine.run_scenario(&scenario).await.unwrap();
    assert_eq!(result.state, ScenarioState::Aborted);
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
    assert_eq!(result.steps[2].status, StepStatus::Skipped);

    let scenario = scenario.with_failure_mode(FailureMode::CollectAll);
    let result = engine.run_scenario(&scenario).await.unwrap();
    assert_eq!(result.state, ScenarioState::Completed);
    assert!(!result.passed());
    assert!(matches!(result.steps[0].status, StepStatus::Failed { .. }));
    assert!(result.steps[1].status.is_passed());
    assert!(matches!(result.steps[2].status, StepStatus::Failed { .. }));
}

#[tokio::test]
async fn test_flaky_click_is_retried() {
    let browser = FakeBrowser::new();
    browser.flaky("testid=confirm", 2);
    let engine = ExecutionEngine::new(config("http://localhost:3000"))
        .unwrap()
        .with_browser(browser.driver());

    let scenario = Scenario::new("flaky").step(click(Locator::test_id("confirm")));
    let result = engine.run_scenario(&scenario).await.unwrap();

    assert!(result.passed(), "{:?}", result.steps[0].status);
    assert_eq!(result.steps[0].attempts, 3);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let browser = FakeBrowser::new();
    browser.flaky("testid=confirm", 10);
    let engine = ExecutionEngine::new(config("http://localhost:3000"))
        .unwrap()
        .with_browser(browser.driver());

    let scenario = Scenario::new("missing")
        .step(click(Locator::test_id("confirm")).retry(RetryPolicy {
            attempts: 2,
            backoff_ms: 5,
        }));
    let result = engine.run_scenario(&scenario).await.unwrap();

    assert_eq!(result.steps[0].attempts, 2);
    assert_eq!(
        result.steps[0].status,
        StepStatus::Failed {
            reason: "element not found: testid=confirm".into()
        }
    );
    assert_eq!(engine.open_handles(), 0);
}

#[tokio::test]
async fn test_assertions_are_not_retried() {
    let app = FakeApp::spawn().await;
    let engine = ExecutionEngine::new(config(&app.base_url)).unwrap();

    let scenario =
        Scenario::new("no-retry").step(get("/api/visit-types").expect(Expectation::status(&[204])));
    let result = engine.run_scenario(&scenario).await.unwrap();

    assert_eq!(result.steps[0].attempts, 1);
    assert_eq!(app.requests().len(), 1);
}

#[tokio::test]
async fn test_wait_for_polls_until_visible() {
    let browser = FakeBrowser::new();
    browser.appears_after("testid=slots", 3);
    let engine = ExecutionEngine::new(config("http://localhost:3000"))
        .unwrap()
        .with_browser(browser.driver());

    let scenario = Scenario::new("wait").step(Step::new(Action::WaitFor {
        until: Condition::Visible(Locator::test_id("slots")),
        timeout_ms: Some(2_000),
        poll_interval_ms: Some(10),
    }));
    let result = engine.run_scenario(&scenario).await.unwrap();
    assert!(result.passed(), "{:?}", result.steps[0].status);
}

#[tokio::test]
async fn test_wait_for_http_status_times_out() {
    let base_url = format!("http://127.0.0.1:{}", closed_port());
    let engine = ExecutionEngine::new(config(&base_url)).unwrap();

    let scenario = Scenario::new("never-up").step(Step::new(Action::WaitFor {
        until: Condition::HttpStatus {
            url: "/api/health".into(),
            status: 200,
        },
        timeout_ms: Some(200),
        poll_interval_ms: Some(20),
    }));
    let result = engine.run_scenario(&scenario).await.unwrap();

    match &result.steps[0].status {
        StepStatus::Failed { reason } => assert!(reason.contains("condition not met"), "{reason}"),
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn test_wait_for_slow_endpoint_stops_at_its_own_timeout() {
    let app = FakeApp::spawn().await;
    let engine = ExecutionEngine::new(config(&app.base_url)).unwrap();

    let scenario = Scenario::new("slow").step(Step::new(Action::WaitFor {
        until: Condition::HttpStatus {
            url: "/api/slow".into(),
            status: 200,
        },
        timeout_ms: Some(300),
        poll_interval_ms: Some(50),
    }));

    let started = std::time::Instant::now();
    let result = engine.run_scenario(&scenario).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_500), "{:?}", started.elapsed());
    assert_eq!(result.steps[0].attempts, 1);
    match &result.steps[0].status {
        StepStatus::Failed { reason } => {
            assert!(reason.starts_with("condition not met within 300 ms"), "{reason}")
        }
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn test_wait_for_slow_browser_check_stops_at_its_own_timeout() {
    let browser = FakeBrowser::new();
    browser.slow_checks(Duration::from_secs(10));
    let engine = ExecutionEngine::new(config("http://localhost:3000"))
        .unwrap()
        .with_browser(browser.driver());

    let scenario = Scenario::new("slow-ui").step(Step::new(Action::WaitFor {
        until: Condition::Visible(Locator::test_id("spinner-done")),
        timeout_ms: Some(200),
        poll_interval_ms: None,
    }));

    let started = std::time::Instant::now();
    let result = engine.run_scenario(&scenario).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert_eq!(result.steps[0].attempts, 1);
    assert!(matches!(
        &result.steps[0].status,
        StepStatus::Failed { reason } if reason.starts_with("condition not met")
    ));
    assert_eq!(browser.open_contexts(), 0);
}

#[tokio::test]
async fn test_panicking_step_is_errored_and_releases() {
    let app = FakeApp::spawn().await;
    let browser = FakeBrowser::new();
    browser.panics_on("text=Confirmar");
    let engine = ExecutionEngine::new(config(&app.base_url))
        .unwrap()
        .with_browser(browser.driver());

    let scenario = Scenario::new("crash")
        .step(navigate("/book"))
        .step(click(Locator::text("Confirmar")))
        .step(get("/api/visit-types"))
        .step(click(Locator::text("Volver")));
    let result = engine.run_scenario(&scenario).await.unwrap();

    assert_eq!(result.state, ScenarioState::Aborted);
    assert!(result.steps[0].status.is_passed());
    match &result.steps[1].status {
        StepStatus::Errored { error } => {
            assert!(error.starts_with("panicked: driver crashed"), "{error}")
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(result.steps.len(), 4);
    assert_eq!(result.steps[2].status, StepStatus::Skipped);
    assert_eq!(result.steps[3].status, StepStatus::Skipped);
    assert!(app.requests().is_empty());

    assert_eq!(browser.open_contexts(), 0);
    assert_eq!(engine.open_handles(), 0);
}

#[tokio::test]
async fn test_read_only_endpoint_is_idempotent() {
    let app = FakeApp::spawn().await;
    let engine = ExecutionEngine::new(config(&app.base_url)).unwrap();

    let scenario = Scenario::new("twice")
        .step(get("/api/visit-types"))
        .step(get("/api/visit-types"));
    let result = engine.run_scenario(&scenario).await.unwrap();

    assert_eq!(result.steps[0].statuses, result.steps[1].statuses);
    assert_eq!(result.steps[0].statuses, vec![200]);
}

#[tokio::test]
async fn test_cancellation_aborts_and_releases() {
    let browser = FakeBrowser::new();
    let engine = ExecutionEngine::new(config("http://localhost:3000"))
        .unwrap()
        .with_browser(browser.driver());

    let scenario = Scenario::new("long")
        .step(navigate("/"))
        .step(Step::new(Action::Sleep { ms: 30_000 }))
        .step(click(Locator::text("after")))
        .teardown_step(click(Locator::text("cleanup")));

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let started = std::time::Instant::now();
    let result = engine.run_scenario(&scenario).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.state, ScenarioState::Aborted);
    assert_eq!(
        result.steps[1].status,
        StepStatus::Errored {
            error: "cancelled".into()
        }
    );
    assert_eq!(result.steps[2].status, StepStatus::Skipped);
    assert_eq!(result.teardown[0].status, StepStatus::Skipped);
    assert_eq!(browser.open_contexts(), 0);
    assert_eq!(engine.open_handles(), 0);
}

#[tokio::test]
async fn test_teardown_runs_after_abort_without_changing_status() {
    let app = FakeApp::spawn().await;
    let engine = ExecutionEngine::new(config(&app.base_url)).unwrap();

    let scenario = Scenario::new("cleanup")
        .step(
            http(
                HttpMethod::Post,
                "/api/appointments/create",
                Some(json!({"date": "{date:+3d}", "time": "10:00"})),
            )
            .expect(Expectation::status(&[201]))
            .extract(Extraction::json("id", &["/id"])),
        )
        .step(get("/api/visit-types").expect(Expectation::status(&[500])))
        .teardown_step(
            http(HttpMethod::Post, "/api/appointments/{id}/cancel", None)
                .expect(Expectation::status(&[200])),
        );

    let result = engine.run_scenario(&scenario).await.unwrap();

    assert!(!result.passed());
    assert_eq!(result.state, ScenarioState::Aborted);
    assert!(result.teardown[0].status.is_passed(), "{:?}", result.teardown);
    assert_eq!(app.appointment(1).unwrap()["status"], "cancelled");
}

#[tokio::test]
async fn test_browser_scenario_without_driver_aborts_run() {
    let engine = ExecutionEngine::new(config("http://localhost:3000")).unwrap();
    let scenario = Scenario::new("needs-browser").step(navigate("/"));

    let err = engine.run(&[scenario]).await.unwrap_err();
    assert!(err.to_string().contains("needs-browser"));
    assert_eq!(engine.open_handles(), 0);
}

#[tokio::test]
async fn test_unknown_variable_fails_the_step() {
    let app = FakeApp::spawn().await;
    let engine = ExecutionEngine::new(config(&app.base_url)).unwrap();

    let scenario = Scenario::new("typo").step(get("/api/appointments/{appointment_id}"));
    let result = engine.run_scenario(&scenario).await.unwrap();

    match &result.steps[0].status {
        StepStatus::Failed { reason } => assert!(reason.contains("appointment_id")),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(app.requests().is_empty());
}
