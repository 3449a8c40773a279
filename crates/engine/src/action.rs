//! Action primitives
//!
//! An action is immutable data. `perform` renders its templates against the
//! scenario's session, runs it against the scenario's resources and returns
//! what it observed; it never touches the step list.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::browser::{BrowserContext, LoadState, NavigationOutcome};
use crate::config::TimeoutConfig;
use crate::error::ActionError;
use crate::http::{resolve_url, HttpMethod, HttpRequest, HttpResponse, HttpSession};
use crate::locator::Locator;
use crate::session::Session;
use crate::template::Renderer;

/// One atomic browser or network operation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: LoadState,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Click {
        locator: Locator,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Fill {
        locator: Locator,
        value: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Http {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        require_json: bool,
    },
    Sleep {
        ms: u64,
    },
    WaitFor {
        until: Condition,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        poll_interval_ms: Option<u64>,
    },
}

/// Predicate polled by `wait_for`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConditionFields", into = "ConditionFields")]
pub enum Condition {
    Visible(Locator),
    Hidden(Locator),
    UrlContains(String),
    HttpStatus { url: String, status: u16 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    visible: Option<Locator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hidden: Option<Locator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http_status: Option<HttpStatusFields>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HttpStatusFields {
    url: String,
    status: u16,
}

impl TryFrom<ConditionFields> for Condition {
    type Error = String;

    fn try_from(fields: ConditionFields) -> Result<Self, Self::Error> {
        let mut found = Vec::new();
        if let Some(locator) = fields.visible {
            found.push(Condition::Visible(locator));
        }
        if let Some(text) = fields.text {
            found.push(Condition::Visible(Locator::Text(text)));
        }
        if let Some(locator) = fields.hidden {
            found.push(Condition::Hidden(locator));
        }
        if let Some(fragment) = fields.url_contains {
            found.push(Condition::UrlContains(fragment));
        }
        if let Some(http) = fields.http_status {
            found.push(Condition::HttpStatus {
                url: http.url,
                status: http.status,
            });
        }

        match found.len() {
            1 => Ok(found.remove(0)),
            0 => Err(
                "condition needs one of visible, text, hidden, url_contains, http_status"
                    .to_string(),
            ),
            n => Err(format!("condition has {n} predicates, expected exactly one")),
        }
    }
}

impl From<Condition> for ConditionFields {
    fn from(condition: Condition) -> Self {
        let mut fields = ConditionFields::default();
        match condition {
            Condition::Visible(locator) => fields.visible = Some(locator),
            Condition::Hidden(locator) => fields.hidden = Some(locator),
            Condition::UrlContains(fragment) => fields.url_contains = Some(fragment),
            Condition::HttpStatus { url, status } => {
                fields.http_status = Some(HttpStatusFields { url, status })
            }
        }
        fields
    }
}

impl Condition {
    pub fn needs_browser(&self) -> bool {
        !matches!(self, Condition::HttpStatus { .. })
    }

    fn render<V: crate::template::Variables + ?Sized>(
        &self,
        renderer: &Renderer<'_, V>,
    ) -> Result<Self, String> {
        Ok(match self {
            Condition::Visible(locator) => Condition::Visible(locator.try_map(|s| renderer.render(s))?),
            Condition::Hidden(locator) => Condition::Hidden(locator.try_map(|s| renderer.render(s))?),
            Condition::UrlContains(fragment) => Condition::UrlContains(renderer.render(fragment)?),
            Condition::HttpStatus { url, status } => Condition::HttpStatus {
                url: renderer.render(url)?,
                status: *status,
            },
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Visible(locator) => write!(f, "{locator} visible"),
            Condition::Hidden(locator) => write!(f, "{locator} hidden"),
            Condition::UrlContains(fragment) => write!(f, "url contains '{fragment}'"),
            Condition::HttpStatus { url, status } => write!(f, "GET {url} returns {status}"),
        }
    }
}

/// What an action observed
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutput {
    None,
    Page { url: String, timed_out: bool },
    Http(HttpResponse),
    /// Every output of a repeated step, in order
    Batch(Vec<ActionOutput>),
    Condition { polls: u32 },
}

impl ActionOutput {
    /// HTTP responses carried by this output, flattened across batches
    pub fn responses(&self) -> Vec<&HttpResponse> {
        match self {
            ActionOutput::Http(response) => vec![response],
            ActionOutput::Batch(items) => items.iter().flat_map(|o| o.responses()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn statuses(&self) -> Vec<u16> {
        self.responses().iter().map(|r| r.status).collect()
    }

    /// Page URL after the last navigation in this output
    pub fn page_url(&self) -> Option<&str> {
        match self {
            ActionOutput::Page { url, .. } => Some(url),
            ActionOutput::Batch(items) => items.iter().rev().find_map(|o| o.page_url()),
            _ => None,
        }
    }
}

/// Everything an action may read or drive
pub struct ActionContext<'a> {
    pub session: &'a Session,
    pub http: &'a HttpSession,
    pub browser: Option<&'a dyn BrowserContext>,
    pub timeouts: &'a TimeoutConfig,
}

impl<'a> ActionContext<'a> {
    fn require_browser(&self, what: &str) -> Result<&'a dyn BrowserContext, ActionError> {
        self.browser
            .ok_or_else(|| ActionError::NoBrowser(what.to_string()))
    }
}

fn ms(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

impl Action {
    /// Short human-readable description used as a default step name
    pub fn describe(&self) -> String {
        match self {
            Action::Navigate { url, .. } => format!("navigate {url}"),
            Action::Click { locator, .. } => format!("click {locator}"),
            Action::Fill { locator, .. } => format!("fill {locator}"),
            Action::Http { method, url, .. } => format!("{method} {url}"),
            Action::Sleep { ms } => format!("sleep {ms}ms"),
            Action::WaitFor { until, .. } => format!("wait for {until}"),
        }
    }

    /// Fields accepted next to `action: <tag>`, or None for an unknown tag
    pub fn field_names(tag: &str) -> Option<&'static [&'static str]> {
        let fields: &'static [&'static str] = match tag {
            "navigate" => &["url", "wait_until", "timeout_ms"],
            "click" => &["locator", "timeout_ms"],
            "fill" => &["locator", "value", "timeout_ms"],
            "http" => &["method", "url", "body", "headers", "timeout_ms", "require_json"],
            "sleep" => &["ms"],
            "wait_for" => &["until", "timeout_ms", "poll_interval_ms"],
            _ => return None,
        };
        Some(fields)
    }

    pub fn needs_browser(&self) -> bool {
        match self {
            Action::Navigate { .. } | Action::Click { .. } | Action::Fill { .. } => true,
            Action::WaitFor { until, .. } => until.needs_browser(),
            Action::Http { .. } | Action::Sleep { .. } => false,
        }
    }

    /// Upper bound the action is expected to finish within
    pub fn budget(&self, timeouts: &TimeoutConfig) -> Duration {
        match self {
            Action::Navigate { timeout_ms, .. } => ms(*timeout_ms, timeouts.navigation_ms),
            Action::Click { timeout_ms, .. } | Action::Fill { timeout_ms, .. } => {
                ms(*timeout_ms, timeouts.action_ms)
            }
            Action::Http { timeout_ms, .. } => ms(*timeout_ms, timeouts.http_ms),
            Action::Sleep { ms: duration } => Duration::from_millis(*duration),
            Action::WaitFor { timeout_ms, .. } => ms(*timeout_ms, timeouts.action_ms),
        }
    }

    /// Template strings this action reads
    pub fn templates(&self) -> Vec<String> {
        let mut out = Vec::new();
        match self {
            Action::Navigate { url, .. } => out.push(url.clone()),
            Action::Click { locator, .. } => out.push(locator.to_string()),
            Action::Fill { locator, value, .. } => {
                out.push(locator.to_string());
                out.push(value.clone());
            }
            Action::Http {
                url, body, headers, ..
            } => {
                out.push(url.clone());
                out.extend(headers.values().cloned());
                if let Some(body) = body {
                    collect_strings(body, &mut out);
                }
            }
            Action::Sleep { .. } => {}
            Action::WaitFor { until, .. } => out.push(until.to_string()),
        }
        out
    }

    pub async fn perform(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let renderer = Renderer::new(ctx.session);
        let render = |s: &str| renderer.render(s).map_err(ActionError::Template);

        match self {
            Action::Navigate {
                url,
                wait_until,
                timeout_ms,
            } => {
                let browser = ctx.require_browser("navigate")?;
                let url = resolve_url(ctx.session.base_url(), &render(url)?);
                let timeout = ms(*timeout_ms, ctx.timeouts.navigation_ms);
                match browser.navigate(&url, *wait_until, timeout).await? {
                    NavigationOutcome::Loaded { url } => Ok(ActionOutput::Page {
                        url,
                        timed_out: false,
                    }),
                    NavigationOutcome::TimedOut { url } => {
                        warn!(
                            "Navigation to {} did not reach {} within {:?}, continuing",
                            url,
                            wait_until.as_playwright(),
                            timeout
                        );
                        Ok(ActionOutput::Page {
                            url,
                            timed_out: true,
                        })
                    }
                }
            }

            Action::Click {
                locator,
                timeout_ms,
            } => {
                let browser = ctx.require_browser("click")?;
                let locator = locator.try_map(render)?;
                browser
                    .click(&locator, ms(*timeout_ms, ctx.timeouts.action_ms))
                    .await?;
                Ok(ActionOutput::None)
            }

            Action::Fill {
                locator,
                value,
                timeout_ms,
            } => {
                let browser = ctx.require_browser("fill")?;
                let locator = locator.try_map(render)?;
                let value = render(value)?;
                browser
                    .fill(&locator, &value, ms(*timeout_ms, ctx.timeouts.action_ms))
                    .await?;
                Ok(ActionOutput::None)
            }

            Action::Http {
                method,
                url,
                body,
                headers,
                timeout_ms,
                require_json,
            } => {
                let request = HttpRequest {
                    method: *method,
                    url: resolve_url(ctx.session.base_url(), &render(url)?),
                    headers: headers
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), render(v)?)))
                        .collect::<Result<_, ActionError>>()?,
                    body: body
                        .as_ref()
                        .map(|b| renderer.render_value(b).map_err(ActionError::Template))
                        .transpose()?,
                    timeout: ms(*timeout_ms, ctx.timeouts.http_ms),
                    require_json: *require_json,
                };
                let response = ctx.http.send(&request, ctx.session.auth_token()).await?;
                Ok(ActionOutput::Http(response))
            }

            Action::Sleep { ms: duration } => {
                sleep(Duration::from_millis(*duration)).await;
                Ok(ActionOutput::None)
            }

            Action::WaitFor {
                until,
                timeout_ms,
                poll_interval_ms,
            } => {
                let condition = until.render(&renderer).map_err(ActionError::Template)?;
                let timeout = ms(*timeout_ms, ctx.timeouts.action_ms);
                let interval = ms(*poll_interval_ms, ctx.timeouts.poll_interval_ms);
                wait_for(&condition, ctx, timeout, interval).await
            }
        }
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

async fn wait_for(
    condition: &Condition,
    ctx: &ActionContext<'_>,
    timeout: Duration,
    interval: Duration,
) -> Result<ActionOutput, ActionError> {
    let deadline = Instant::now() + timeout;
    let mut polls = 0;

    loop {
        polls += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if check(condition, ctx, remaining).await? {
            debug!("Condition '{}' met after {} polls", condition, polls);
            return Ok(ActionOutput::Condition { polls });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ActionError::ConditionTimedOut {
                condition: condition.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// One poll, bounded by `remaining`. A poll that runs out of time or cannot
/// reach its target yet counts as "not met".
async fn check(
    condition: &Condition,
    ctx: &ActionContext<'_>,
    remaining: Duration,
) -> Result<bool, ActionError> {
    let poll = async {
        match condition {
            Condition::Visible(locator) => ctx.require_browser("wait_for")?.is_visible(locator).await,
            Condition::Hidden(locator) => {
                Ok(!ctx.require_browser("wait_for")?.is_visible(locator).await?)
            }
            Condition::UrlContains(fragment) => Ok(ctx
                .require_browser("wait_for")?
                .current_url()
                .await?
                .contains(fragment.as_str())),
            Condition::HttpStatus { url, status } => {
                let request = HttpRequest::get(
                    resolve_url(ctx.session.base_url(), url),
                    remaining.min(Duration::from_millis(ctx.timeouts.http_ms)),
                );
                match ctx.http.send(&request, ctx.session.auth_token()).await {
                    Ok(response) => Ok(response.status == *status),
                    Err(ActionError::Transport(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    };

    match tokio::time::timeout(remaining, poll).await {
        Ok(Err(ActionError::ActionTimeout { .. })) | Err(_) => Ok(false),
        Ok(result) => result,
    }
}
