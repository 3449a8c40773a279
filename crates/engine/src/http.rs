//! HTTP session used by `http` steps and HTTP wait conditions

use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::{ActionError, RunnerError, RunnerResult};

/// HTTP method of a request step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "head")]
    Head,
}

impl HttpMethod {
    fn as_reqwest(&self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Head => Method::HEAD,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_reqwest())
    }
}

/// A fully rendered request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
    /// Fail with a decode error when the body is not JSON
    pub require_json: bool,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout,
            require_json: false,
        }
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }
}

/// Response body: JSON when it parses, raw text otherwise
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl HttpResponse {
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn text(&self) -> String {
        match &self.body {
            ResponseBody::Json(value) => value.to_string(),
            ResponseBody::Text(text) => text.clone(),
            ResponseBody::Empty => String::new(),
        }
    }

    /// Header lookup, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Per-scenario HTTP client with its own cookie jar and connection pool
pub struct HttpSession {
    client: Client,
}

impl HttpSession {
    pub fn new() -> RunnerResult<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(concat!("stepwise/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RunnerError::Http)?;
        Ok(Self { client })
    }

    /// Send a request. `bearer` is used unless the request sets
    /// `Authorization` itself.
    pub async fn send(
        &self,
        request: &HttpRequest,
        bearer: Option<&str>,
    ) -> Result<HttpResponse, ActionError> {
        let what = format!("{} {}", request.method, request.url);
        let mut builder = self
            .client
            .request(request.method.as_reqwest(), &request.url)
            .timeout(request.timeout);

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ActionError::Interaction(format!("invalid header '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ActionError::Interaction(format!("invalid header value: {e}")))?;
            builder = builder.header(name, value);
        }
        if let Some(token) = bearer {
            if !request.has_header(AUTHORIZATION.as_str()) {
                builder = builder.bearer_auth(token);
            }
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, &what, request.timeout))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| classify(e, &what, request.timeout))?;

        debug!("{} -> {} ({} bytes)", what, status, text.len());

        let body = decode_body(text, request.require_json)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn decode_body(text: String, require_json: bool) -> Result<ResponseBody, ActionError> {
    if text.trim().is_empty() {
        if require_json {
            return Err(ActionError::Decode("expected a JSON body, got an empty one".into()));
        }
        return Ok(ResponseBody::Empty);
    }
    match serde_json::from_str(&text) {
        Ok(value) => Ok(ResponseBody::Json(value)),
        Err(e) if require_json => Err(ActionError::Decode(format!(
            "expected a JSON body: {e}"
        ))),
        Err(_) => Ok(ResponseBody::Text(text)),
    }
}

fn classify(error: reqwest::Error, what: &str, timeout: Duration) -> ActionError {
    if error.is_timeout() {
        ActionError::ActionTimeout {
            what: what.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if error.is_builder() {
        ActionError::Interaction(format!("{what}: {error}"))
    } else {
        ActionError::Transport(format!("{what}: {error}"))
    }
}

/// Join a step URL onto the base URL. Absolute URLs pass through.
pub fn resolve_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}
