//! Shared fixtures: an in-memory browser and a fake appointment API

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use stepwise_engine::browser::{
    BrowserContext, BrowserDriver, ContextOptions, LoadState, NavigationOutcome,
};
use stepwise_engine::error::{ActionError, BrowserError};
use stepwise_engine::Locator;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepwise_engine=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Port that nothing listens on
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// Fake browser
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    log: Mutex<Vec<String>>,
    open: AtomicUsize,
    created: AtomicUsize,
    /// locator -> failures left before it resolves
    flaky: Mutex<HashMap<String, u32>>,
    /// locator -> (visible after this many checks)
    appears_after: Mutex<HashMap<String, u32>>,
    /// Delay before every visibility check answers
    check_delay: Mutex<Option<Duration>>,
    /// Clicking this locator panics
    panic_on: Mutex<Option<String>>,
}

/// In-memory browser: logs every operation and counts open contexts
#[derive(Clone, Default)]
pub struct FakeBrowser {
    state: Arc<FakeState>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// `locator` is not found for the first `failures` attempts
    pub fn flaky(&self, locator: &str, failures: u32) {
        self.state.flaky.lock().insert(locator.to_string(), failures);
    }

    /// `locator` only becomes visible on the `checks`-th visibility check
    pub fn appears_after(&self, locator: &str, checks: u32) {
        self.state
            .appears_after
            .lock()
            .insert(locator.to_string(), checks);
    }

    /// Every visibility check takes `delay` to answer
    pub fn slow_checks(&self, delay: Duration) {
        *self.state.check_delay.lock() = Some(delay);
    }

    /// Clicking `locator` panics inside the driver
    pub fn panics_on(&self, locator: &str) {
        *self.state.panic_on.lock() = Some(locator.to_string());
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    pub fn open_contexts(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn driver(&self) -> Arc<dyn BrowserDriver> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn new_context(
        &self,
        _options: &ContextOptions,
    ) -> Result<Box<dyn BrowserContext>, BrowserError> {
        let n = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            id: format!("ctx-{n}"),
            state: self.state.clone(),
            url: Mutex::new("about:blank".to_string()),
            fields: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn shutdown(&self) -> Result<(), BrowserError> {
        self.state.log.lock().push("shutdown".to_string());
        Ok(())
    }
}

struct FakeContext {
    id: String,
    state: Arc<FakeState>,
    url: Mutex<String>,
    fields: Mutex<HashMap<String, String>>,
    closed: AtomicBool,
}

impl FakeContext {
    fn record(&self, op: String) {
        self.state.log.lock().push(format!("{} {}", self.id, op));
    }

    fn resolve(&self, locator: &Locator) -> Result<(), ActionError> {
        let key = locator.to_string();
        let mut flaky = self.state.flaky.lock();
        if let Some(left) = flaky.get_mut(&key) {
            if *left > 0 {
                *left -= 1;
                return Err(ActionError::ElementNotFound { locator: key });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserContext for FakeContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(
        &self,
        url: &str,
        _wait_until: LoadState,
        _timeout: Duration,
    ) -> Result<NavigationOutcome, ActionError> {
        self.record(format!("navigate {url}"));
        *self.url.lock() = url.to_string();
        Ok(NavigationOutcome::Loaded {
            url: url.to_string(),
        })
    }

    async fn click(&self, locator: &Locator, _timeout: Duration) -> Result<(), ActionError> {
        self.record(format!("click {locator}"));
        let key = locator.to_string();
        if self.state.panic_on.lock().as_deref() == Some(key.as_str()) {
            panic!("driver crashed clicking {key}");
        }
        self.resolve(locator)
    }

    async fn fill(
        &self,
        locator: &Locator,
        value: &str,
        _timeout: Duration,
    ) -> Result<(), ActionError> {
        self.record(format!("fill {locator} {value}"));
        self.resolve(locator)?;
        self.fields.lock().insert(locator.to_string(), value.to_string());
        Ok(())
    }

    async fn is_visible(&self, locator: &Locator) -> Result<bool, ActionError> {
        let delay = *self.state.check_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let key = locator.to_string();
        let mut appears = self.state.appears_after.lock();
        match appears.get_mut(&key) {
            Some(left) if *left > 1 => {
                *left -= 1;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn text(&self, locator: &Locator, _timeout: Duration) -> Result<String, ActionError> {
        self.resolve(locator)?;
        Ok(self
            .fields
            .lock()
            .get(&locator.to_string())
            .cloned()
            .unwrap_or_else(|| format!("text of {locator}")))
    }

    async fn current_url(&self) -> Result<String, ActionError> {
        Ok(self.url.lock().clone())
    }

    async fn close(&self) -> Result<(), ActionError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open.fetch_sub(1, Ordering::SeqCst);
            self.record("close".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake appointment API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Requests to /api/health-insurance answered 200 before 429s start
    pub rate_limit: usize,
    /// Accept bookings in the past (a regression the suite must catch)
    pub accept_past_dates: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            rate_limit: 5,
            accept_past_dates: false,
        }
    }
}

struct AppState {
    options: AppOptions,
    next_id: AtomicU64,
    appointments: Mutex<HashMap<u64, Value>>,
    insurance_hits: AtomicUsize,
    requests: Mutex<Vec<String>>,
}

type Shared = Arc<AppState>;

/// Fake of the appointment application on an ephemeral port
pub struct FakeApp {
    pub base_url: String,
    state: Shared,
    server: JoinHandle<()>,
}

impl FakeApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(AppOptions::default()).await
    }

    pub async fn spawn_with(options: AppOptions) -> Self {
        let state = Arc::new(AppState {
            options,
            next_id: AtomicU64::new(1),
            appointments: Mutex::new(HashMap::new()),
            insurance_hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/api/health", get(|| async { Json(json!({"status": "ok"})) }))
            .route("/api/appointments/create", post(create_appointment))
            .route("/api/appointments/:id", get(get_appointment))
            .route("/api/appointments/:id/cancel", post(cancel_appointment))
            .route("/api/health-insurance", get(health_insurance))
            .route("/api/visit-types", get(visit_types))
            .route("/api/auth/login", post(login))
            .route("/api/whoami", get(whoami))
            .route("/api/slow", get(slow))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            server,
        }
    }

    /// "METHOD path" of every request, in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    pub fn appointment(&self, id: u64) -> Option<Value> {
        self.state.appointments.lock().get(&id).cloned()
    }
}

impl Drop for FakeApp {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn log(state: &Shared, line: String) {
    state.requests.lock().push(line);
}

async fn create_appointment(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    log(&state, "POST /api/appointments/create".into());

    let Some(date) = body.get("date").and_then(Value::as_str) else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"errors": {"date": "required"}})),
        )
            .into_response();
    };
    let Ok(date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "invalid date format"})),
        )
            .into_response();
    };

    let in_past = date < Local::now().date_naive();
    if in_past && !state.options.accept_past_dates {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "cannot book an appointment in the past"})),
        )
            .into_response();
    }

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let appointment = json!({
        "id": id,
        "date": date.to_string(),
        "time": body.get("time").cloned().unwrap_or(Value::Null),
        "status": "scheduled",
        "cancellationToken": format!("cancel-{id}"),
    });
    state.appointments.lock().insert(id, appointment.clone());

    let status = if in_past {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(appointment)).into_response()
}

async fn get_appointment(State(state): State<Shared>, Path(id): Path<u64>) -> Response {
    log(&state, format!("GET /api/appointments/{id}"));
    match state.appointments.lock().get(&id) {
        Some(appointment) => Json(appointment.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response(),
    }
}

async fn cancel_appointment(State(state): State<Shared>, Path(id): Path<u64>) -> Response {
    log(&state, format!("POST /api/appointments/{id}/cancel"));
    let mut appointments = state.appointments.lock();
    let Some(appointment) = appointments.get_mut(&id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response();
    };
    if appointment["status"] == "cancelled" {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "already cancelled"})),
        )
            .into_response();
    }
    appointment["status"] = json!("cancelled");
    Json(json!({"id": id, "status": "cancelled"})).into_response()
}

async fn health_insurance(State(state): State<Shared>) -> Response {
    log(&state, "GET /api/health-insurance".into());
    let hits = state.insurance_hits.fetch_add(1, Ordering::SeqCst) + 1;
    if hits > state.options.rate_limit {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "too many requests"})),
        )
            .into_response();
    }
    Json(json!([
        {"id": 1, "name": "OSDE"},
        {"id": 2, "name": "Swiss Medical"}
    ]))
    .into_response()
}

async fn visit_types(State(state): State<Shared>) -> Response {
    log(&state, "GET /api/visit-types".into());
    Json(json!([
        {"id": 1, "name": "Primera consulta", "duration": 30},
        {"id": 2, "name": "Control", "duration": 15}
    ]))
    .into_response()
}

async fn login(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    log(&state, "POST /api/auth/login".into());
    let Some(username) = body.get("username").and_then(Value::as_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "username required"})),
        )
            .into_response();
    };
    let token = format!("token-{username}");
    (
        [(header::SET_COOKIE, format!("session={token}; Path=/"))],
        Json(json!({"token": token})),
    )
        .into_response()
}

/// Answers 200, but only after two seconds
async fn slow(State(state): State<Shared>) -> Response {
    log(&state, "GET /api/slow".into());
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({"status": "ok"})).into_response()
}

async fn whoami(State(state): State<Shared>, headers: HeaderMap) -> Response {
    log(&state, "GET /api/whoami".into());
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from);
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(';')
                .map(str::trim)
                .find_map(|c| c.strip_prefix("session="))
        })
        .map(String::from);

    match (bearer, cookie) {
        (bearer, cookie) if bearer.is_some() || cookie.is_some() => {
            Json(json!({"bearer": bearer, "cookie": cookie})).into_response()
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "not logged in"})),
        )
            .into_response(),
    }
}
