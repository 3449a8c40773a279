//! String templating for step inputs
//!
//! `{name}` reads a session variable, `{date:+3d}`, `{time:+13h}` and
//! `{datetime:-1d}` render relative timestamps, `{env:NAME}` reads the
//! process environment. `{{` and `}}` are literal braces.

use chrono::{DateTime, Duration as ChronoDuration, Local};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Source of variable values
pub trait Variables {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl Variables for std::collections::BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_.\-]*)(?::([^{}]*))?\}")
            .expect("placeholder regex is valid")
    })
}

/// Renders templates against a variable source and a fixed clock
pub struct Renderer<'a, V: Variables + ?Sized> {
    vars: &'a V,
    now: DateTime<Local>,
}

impl<'a, V: Variables + ?Sized> Renderer<'a, V> {
    pub fn new(vars: &'a V) -> Self {
        Self {
            vars,
            now: Local::now(),
        }
    }

    pub fn at(vars: &'a V, now: DateTime<Local>) -> Self {
        Self { vars, now }
    }

    /// Render one string
    pub fn render(&self, input: &str) -> Result<String, String> {
        if !input.contains('{') && !input.contains('}') {
            return Ok(input.to_string());
        }

        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in placeholder().captures_iter(input) {
            let whole = caps.get(0).expect("group 0 always matches");
            out.push_str(&input[last..whole.start()]);
            last = whole.end();

            match whole.as_str() {
                "{{" => out.push('{'),
                "}}" => out.push('}'),
                _ => {
                    let name = &caps[1];
                    let arg = caps.get(2).map(|m| m.as_str());
                    out.push_str(&self.expand(name, arg)?);
                }
            }
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Render every string leaf of a JSON value
    pub fn render_value(&self, value: &Value) -> Result<Value, String> {
        Ok(match value {
            Value::String(s) => Value::String(self.render(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    rendered.insert(self.render(k)?, self.render_value(v)?);
                }
                Value::Object(rendered)
            }
            other => other.clone(),
        })
    }

    fn expand(&self, name: &str, arg: Option<&str>) -> Result<String, String> {
        match (name, arg) {
            ("date", arg) => Ok(self.shifted(arg)?.format("%Y-%m-%d").to_string()),
            ("time", arg) => Ok(self.shifted(arg)?.format("%H:%M").to_string()),
            ("datetime", arg) => Ok(self.shifted(arg)?.to_rfc3339()),
            ("env", Some(key)) => {
                std::env::var(key).map_err(|_| format!("environment variable '{key}' is not set"))
            }
            (name, None) => self
                .vars
                .lookup(name)
                .ok_or_else(|| format!("unknown variable '{name}'")),
            (name, Some(_)) => Err(format!("unknown template function '{name}'")),
        }
    }

    fn shifted(&self, arg: Option<&str>) -> Result<DateTime<Local>, String> {
        let offset = parse_offset(arg.unwrap_or("today"))?;
        Ok(self.now + offset)
    }
}

/// `today`, `now`, `yesterday`, `tomorrow`, or a signed amount with a
/// `d`/`h`/`m` unit (`+3d`, `-1d`, `+13h`, `90m`)
pub fn parse_offset(raw: &str) -> Result<ChronoDuration, String> {
    let raw = raw.trim();
    match raw {
        "" | "today" | "now" | "0" => return Ok(ChronoDuration::zero()),
        "yesterday" => return Ok(ChronoDuration::days(-1)),
        "tomorrow" => return Ok(ChronoDuration::days(1)),
        _ => {}
    }

    let Some((split, _)) = raw.char_indices().last() else {
        return Err(format!("invalid time offset '{raw}'"));
    };
    let (digits, unit) = raw.split_at(split);
    let amount: i64 = digits
        .trim_start_matches('+')
        .parse()
        .map_err(|_| format!("invalid time offset '{raw}'"))?;

    match unit {
        "d" => Ok(ChronoDuration::days(amount)),
        "h" => Ok(ChronoDuration::hours(amount)),
        "m" => Ok(ChronoDuration::minutes(amount)),
        _ => Err(format!("invalid time offset unit in '{raw}' (use d, h or m)")),
    }
}

/// Variable names referenced by a template (excluding functions)
pub fn referenced_variables(input: &str) -> Vec<String> {
    placeholder()
        .captures_iter(input)
        .filter(|caps| caps.get(2).is_none())
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| !matches!(name.as_str(), "date" | "time" | "datetime"))
        .collect()
}
