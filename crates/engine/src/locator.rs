//! Element locators
//!
//! A locator is data, not page structure: scenarios should prefer the
//! semantic forms (`role`, `label`, `test_id`, `text`) and fall back to
//! `css`/`xpath` only when nothing stable exists.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How an element is found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLocator", into = "LocatorFields")]
pub enum Locator {
    Css(String),
    XPath(String),
    Text(String),
    Role { role: String, name: Option<String> },
    Label(String),
    TestId(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn test_id(id: impl Into<String>) -> Self {
        Locator::TestId(id.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Locator::Text(text.into())
    }

    pub fn label(label: impl Into<String>) -> Self {
        Locator::Label(label.into())
    }

    pub fn role(role: impl Into<String>, name: Option<&str>) -> Self {
        Locator::Role {
            role: role.into(),
            name: name.map(String::from),
        }
    }

    /// Parse the shorthand form: `css=`, `xpath=`, `text=`, `testid=`,
    /// `label=`, `role=button[Save]`. A bare string is CSS.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty locator".to_string());
        }

        let Some((engine, value)) = input.split_once('=') else {
            return Ok(Locator::Css(input.to_string()));
        };

        let value = value.trim();
        match engine.trim() {
            "css" => Ok(Locator::Css(value.to_string())),
            "xpath" => Ok(Locator::XPath(value.to_string())),
            "text" => Ok(Locator::Text(value.to_string())),
            "testid" | "test_id" | "data-testid" => Ok(Locator::TestId(value.to_string())),
            "label" => Ok(Locator::Label(value.to_string())),
            "role" => Ok(parse_role(value)),
            // `input[name=email]` and friends are CSS attribute selectors
            _ => Ok(Locator::Css(input.to_string())),
        }
    }

    /// Apply `f` to every string inside the locator (used for templating)
    pub fn try_map<E>(&self, mut f: impl FnMut(&str) -> Result<String, E>) -> Result<Self, E> {
        Ok(match self {
            Locator::Css(s) => Locator::Css(f(s)?),
            Locator::XPath(s) => Locator::XPath(f(s)?),
            Locator::Text(s) => Locator::Text(f(s)?),
            Locator::Label(s) => Locator::Label(f(s)?),
            Locator::TestId(s) => Locator::TestId(f(s)?),
            Locator::Role { role, name } => Locator::Role {
                role: f(role)?,
                name: name.as_deref().map(&mut f).transpose()?,
            },
        })
    }
}

fn parse_role(value: &str) -> Locator {
    match value.split_once('[') {
        Some((role, rest)) => {
            let name = rest.trim_end_matches(']').trim();
            Locator::Role {
                role: role.trim().to_string(),
                name: (!name.is_empty()).then(|| name.to_string()),
            }
        }
        None => Locator::Role {
            role: value.to_string(),
            name: None,
        },
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css={s}"),
            Locator::XPath(s) => write!(f, "xpath={s}"),
            Locator::Text(s) => write!(f, "text={s}"),
            Locator::Label(s) => write!(f, "label={s}"),
            Locator::TestId(s) => write!(f, "testid={s}"),
            Locator::Role { role, name: Some(name) } => write!(f, "role={role}[{name}]"),
            Locator::Role { role, name: None } => write!(f, "role={role}"),
        }
    }
}

/// Wire/YAML form: shorthand string or a map with exactly one engine
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawLocator {
    Shorthand(String),
    Fields(LocatorFields),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocatorFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    css: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    xpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    test_id: Option<String>,
}

impl TryFrom<RawLocator> for Locator {
    type Error = String;

    fn try_from(raw: RawLocator) -> Result<Self, Self::Error> {
        let fields = match raw {
            RawLocator::Shorthand(s) => return Locator::parse(&s),
            RawLocator::Fields(fields) => fields,
        };

        if fields.name.is_some() && fields.role.is_none() {
            return Err("locator 'name' is only valid together with 'role'".to_string());
        }

        let mut found = Vec::new();
        if let Some(v) = fields.css {
            found.push(Locator::Css(v));
        }
        if let Some(v) = fields.xpath {
            found.push(Locator::XPath(v));
        }
        if let Some(v) = fields.text {
            found.push(Locator::Text(v));
        }
        if let Some(role) = fields.role {
            found.push(Locator::Role {
                role,
                name: fields.name,
            });
        }
        if let Some(v) = fields.label {
            found.push(Locator::Label(v));
        }
        if let Some(v) = fields.test_id {
            found.push(Locator::TestId(v));
        }

        match found.len() {
            1 => Ok(found.remove(0)),
            0 => Err("locator needs one of css, xpath, text, role, label, test_id".to_string()),
            n => Err(format!("locator has {n} engines, expected exactly one")),
        }
    }
}

impl From<Locator> for LocatorFields {
    fn from(locator: Locator) -> Self {
        let mut fields = LocatorFields::default();
        match locator {
            Locator::Css(v) => fields.css = Some(v),
            Locator::XPath(v) => fields.xpath = Some(v),
            Locator::Text(v) => fields.text = Some(v),
            Locator::Label(v) => fields.label = Some(v),
            Locator::TestId(v) => fields.test_id = Some(v),
            Locator::Role { role, name } => {
                fields.role = Some(role);
                fields.name = name;
            }
        }
        fields
    }
}
