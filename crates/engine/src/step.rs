//! Scenario steps: one action, its expected post-condition and the values
//! it extracts into the session

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::action::{Action, ActionOutput};
use crate::browser::BrowserContext;
use crate::config::RetryPolicy;
use crate::error::{AssertionFailed, StepError};
use crate::locator::Locator;
use crate::template::{Renderer, Variables};

/// One action plus its expectation and extractions
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "StepFields")]
pub struct Step {
    pub name: Option<String>,
    pub action: Action,
    pub expect: Option<Expectation>,
    pub extract: Vec<Extraction>,
    pub repeat: Option<Repeat>,
    /// Overrides the run's retry policy for this step
    pub retry: Option<RetryPolicy>,
}

/// Step keys plus whatever is left for the action, checked against the
/// action's own fields
#[derive(Debug, Deserialize)]
struct StepFields {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    expect: Option<Expectation>,
    #[serde(default, deserialize_with = "one_or_many")]
    extract: Vec<Extraction>,
    #[serde(default)]
    repeat: Option<Repeat>,
    #[serde(default)]
    retry: Option<RetryPolicy>,
    #[serde(flatten)]
    action: Map<String, Value>,
}

impl TryFrom<StepFields> for Step {
    type Error = String;

    fn try_from(fields: StepFields) -> Result<Self, Self::Error> {
        let tag = fields
            .action
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| "step needs an `action`".to_string())?;
        if let Some(allowed) = Action::field_names(tag) {
            if let Some(unknown) = fields
                .action
                .keys()
                .find(|key| *key != "action" && !allowed.contains(&key.as_str()))
            {
                return Err(format!(
                    "unknown field `{unknown}` for action `{tag}`, expected one of {}",
                    allowed.join(", ")
                ));
            }
        }
        let action: Action =
            serde_json::from_value(Value::Object(fields.action)).map_err(|e| e.to_string())?;

        Ok(Step {
            name: fields.name,
            action,
            expect: fields.expect,
            extract: fields.extract,
            repeat: fields.repeat,
            retry: fields.retry,
        })
    }
}

impl Step {
    pub fn new(action: Action) -> Self {
        Self {
            name: None,
            action,
            expect: None,
            extract: Vec::new(),
            repeat: None,
            retry: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expect = Some(expectation);
        self
    }

    pub fn extract(mut self, extraction: Extraction) -> Self {
        self.extract.push(extraction);
        self
    }

    pub fn repeat(mut self, times: u32, interval_ms: u64) -> Self {
        self.repeat = Some(Repeat { times, interval_ms });
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Name shown in reports
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.action.describe())
    }

    pub fn needs_browser(&self) -> bool {
        self.action.needs_browser() || self.extract.iter().any(|e| e.needs_browser())
    }

    /// Number of times the action runs
    pub fn times(&self) -> u32 {
        self.repeat.map(|r| r.times).unwrap_or(1)
    }
}

/// Run the action several times, collecting every output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Repeat {
    pub times: u32,
    #[serde(default)]
    pub interval_ms: u64,
}

impl Repeat {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Post-conditions checked after the action succeeded. All must hold.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    /// Allowed status codes, checked on every response
    #[serde(default, deserialize_with = "one_or_many")]
    pub status: Vec<u16>,

    /// Top-level JSON fields; at least one must be present
    #[serde(default)]
    pub body_has_any: Vec<String>,

    /// JSON pointer -> expected value (string values are templated)
    #[serde(default)]
    pub json: BTreeMap<String, Value>,

    /// Case-insensitive substring of the raw body
    #[serde(default)]
    pub body_contains: Option<String>,

    /// Every response status must be in this set
    #[serde(default)]
    pub statuses_within: Vec<u16>,

    /// Each set must be hit by at least one response
    #[serde(default)]
    pub seen_any_of: Vec<Vec<u16>>,

    /// Page URL after navigation contains this fragment
    #[serde(default)]
    pub url_contains: Option<String>,
}

impl Expectation {
    pub fn status(codes: &[u16]) -> Self {
        Self {
            status: codes.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_body_has_any(mut self, fields: &[&str]) -> Self {
        self.body_has_any = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_json(mut self, pointer: &str, value: Value) -> Self {
        self.json.insert(pointer.to_string(), value);
        self
    }

    pub fn with_statuses_within(mut self, codes: &[u16]) -> Self {
        self.statuses_within = codes.to_vec();
        self
    }

    pub fn with_seen_any_of(mut self, codes: &[u16]) -> Self {
        self.seen_any_of.push(codes.to_vec());
        self
    }

    /// Template strings read by the expectation
    pub fn templates(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .json
            .values()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        out.extend(self.body_contains.clone());
        out.extend(self.url_contains.clone());
        out
    }

    pub fn evaluate<V: Variables + ?Sized>(
        &self,
        output: &ActionOutput,
        renderer: &Renderer<'_, V>,
    ) -> Result<(), AssertionFailed> {
        let responses = output.responses();
        let needs_response = !self.status.is_empty()
            || !self.body_has_any.is_empty()
            || !self.json.is_empty()
            || self.body_contains.is_some()
            || !self.statuses_within.is_empty()
            || !self.seen_any_of.is_empty();
        if needs_response && responses.is_empty() {
            return Err(AssertionFailed(
                "no HTTP response to check expectations against".into(),
            ));
        }

        if !self.status.is_empty() {
            for response in &responses {
                if !self.status.contains(&response.status) {
                    return Err(AssertionFailed(status_mismatch(&self.status, response.status)));
                }
            }
        }

        if !self.statuses_within.is_empty() {
            if let Some(stray) = responses
                .iter()
                .find(|r| !self.statuses_within.contains(&r.status))
            {
                return Err(AssertionFailed(format!(
                    "unexpected status {} (allowed: {:?})",
                    stray.status, self.statuses_within
                )));
            }
        }

        for wanted in &self.seen_any_of {
            if !responses.iter().any(|r| wanted.contains(&r.status)) {
                return Err(AssertionFailed(format!(
                    "never saw any of {:?} across {} responses (saw {:?})",
                    wanted,
                    responses.len(),
                    output.statuses()
                )));
            }
        }

        for response in &responses {
            if !self.body_has_any.is_empty() {
                let present = response
                    .json()
                    .and_then(Value::as_object)
                    .map(|obj| self.body_has_any.iter().any(|f| obj.contains_key(f)))
                    .unwrap_or(false);
                if !present {
                    return Err(AssertionFailed(format!(
                        "response body has none of {:?}",
                        self.body_has_any
                    )));
                }
            }

            for (pointer, expected) in &self.json {
                let expected = renderer
                    .render_value(expected)
                    .map_err(AssertionFailed)?;
                let actual = response.json().and_then(|body| body.pointer(pointer));
                if !json_matches(actual, &expected) {
                    return Err(AssertionFailed(format!(
                        "at {pointer}: expected {expected}, got {}",
                        actual.map(Value::to_string).unwrap_or_else(|| "nothing".into())
                    )));
                }
            }

            if let Some(fragment) = &self.body_contains {
                let fragment = renderer.render(fragment).map_err(AssertionFailed)?;
                if !response
                    .text()
                    .to_lowercase()
                    .contains(&fragment.to_lowercase())
                {
                    return Err(AssertionFailed(format!(
                        "response body does not contain '{fragment}'"
                    )));
                }
            }
        }

        if let Some(fragment) = &self.url_contains {
            let fragment = renderer.render(fragment).map_err(AssertionFailed)?;
            match output.page_url() {
                Some(url) if url.contains(&fragment) => {}
                Some(url) => {
                    return Err(AssertionFailed(format!(
                        "page url '{url}' does not contain '{fragment}'"
                    )))
                }
                None => return Err(AssertionFailed("no page url to check".into())),
            }
        }

        Ok(())
    }
}

fn status_mismatch(expected: &[u16], actual: u16) -> String {
    let wants_client_error = expected.iter().all(|s| (400..500).contains(s));
    if wants_client_error && (200..300).contains(&actual) {
        format!("expected validation error, got success (status {actual})")
    } else {
        format!("expected status in {expected:?}, got {actual}")
    }
}

/// Templated strings compare against any scalar rendering of the actual
/// value, so `"{id}"` matches a numeric id
fn json_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (Some(actual), expected) if actual == expected => true,
        (Some(Value::Number(n)), Value::String(s)) => n.to_string() == *s,
        (Some(Value::Bool(b)), Value::String(s)) => b.to_string() == *s,
        _ => false,
    }
}

/// Where an extracted value comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractSource {
    /// JSON pointers, first present one wins
    Json(Vec<String>),
    Header(String),
    Status,
    /// Inner text of an element on the page
    Text(Locator),
}

/// Store a value from the step's output into the session
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ExtractionFields")]
pub struct Extraction {
    pub name: String,
    pub source: ExtractSource,
    /// Also use the value as the session's bearer token
    pub auth: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtractionFields {
    name: String,
    #[serde(default, deserialize_with = "one_or_many")]
    json: Vec<String>,
    #[serde(default)]
    header: Option<String>,
    #[serde(default)]
    status: bool,
    #[serde(default)]
    text: Option<Locator>,
    #[serde(default)]
    auth: bool,
}

impl TryFrom<ExtractionFields> for Extraction {
    type Error = String;

    fn try_from(fields: ExtractionFields) -> Result<Self, Self::Error> {
        let mut found = Vec::new();
        if !fields.json.is_empty() {
            found.push(ExtractSource::Json(fields.json));
        }
        if let Some(header) = fields.header {
            found.push(ExtractSource::Header(header));
        }
        if fields.status {
            found.push(ExtractSource::Status);
        }
        if let Some(locator) = fields.text {
            found.push(ExtractSource::Text(locator));
        }

        let source = match found.len() {
            1 => found.remove(0),
            0 => {
                return Err(format!(
                    "extraction '{}' needs one of json, header, status, text",
                    fields.name
                ))
            }
            n => {
                return Err(format!(
                    "extraction '{}' has {n} sources, expected exactly one",
                    fields.name
                ))
            }
        };

        Ok(Extraction {
            name: fields.name,
            source,
            auth: fields.auth,
        })
    }
}

impl Extraction {
    pub fn json(name: impl Into<String>, pointers: &[&str]) -> Self {
        Self {
            name: name.into(),
            source: ExtractSource::Json(pointers.iter().map(|p| p.to_string()).collect()),
            auth: false,
        }
    }

    pub fn as_auth(mut self) -> Self {
        self.auth = true;
        self
    }

    pub fn needs_browser(&self) -> bool {
        matches!(self.source, ExtractSource::Text(_))
    }

    /// Pull the value out of the last response (or the page)
    pub async fn apply(
        &self,
        output: &ActionOutput,
        browser: Option<&dyn BrowserContext>,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let missing = |what: String| -> StepError {
            AssertionFailed(format!("cannot extract '{}': {}", self.name, what)).into()
        };
        let last = output.responses().last().copied();

        match &self.source {
            ExtractSource::Json(pointers) => {
                let body = last
                    .and_then(|r| r.json())
                    .ok_or_else(|| missing("response has no JSON body".into()))?;
                pointers
                    .iter()
                    .find_map(|p| body.pointer(p).filter(|v| !v.is_null()))
                    .cloned()
                    .ok_or_else(|| missing(format!("none of {pointers:?} present")))
            }
            ExtractSource::Header(header) => last
                .and_then(|r| r.header(header))
                .map(|v| Value::String(v.to_string()))
                .ok_or_else(|| missing(format!("no '{header}' header"))),
            ExtractSource::Status => last
                .map(|r| Value::from(r.status))
                .ok_or_else(|| missing("no HTTP response".into())),
            ExtractSource::Text(locator) => {
                let browser = browser.ok_or_else(|| {
                    StepError::from(crate::error::ActionError::NoBrowser(format!(
                        "extract {}",
                        self.name
                    )))
                })?;
                Ok(Value::String(browser.text(locator, timeout).await?))
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(item) => vec![item],
        OneOrMany::Many(items) => items,
    })
}
