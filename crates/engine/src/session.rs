//! Per-scenario session state

use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::template::Variables;

/// Names the session answers itself; configs and scenarios may not set them
pub const RESERVED_VARIABLES: &[&str] = &["base_url", "auth_token"];

/// Mutable state owned by exactly one scenario run
///
/// Cookies live in the scenario's HTTP client and browser context; this
/// struct holds what steps read and write explicitly.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    base_url: String,
    declared: BTreeMap<String, String>,
    extracted: BTreeMap<String, Value>,
    auth_token: Option<String>,
}

impl Session {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            base_url: base_url.into(),
            declared: BTreeMap::new(),
            extracted: BTreeMap::new(),
            auth_token: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Seed a variable before the first step. Names must be unique.
    pub fn declare(&mut self, name: &str, value: impl Into<String>) -> Result<(), String> {
        if RESERVED_VARIABLES.contains(&name) {
            return Err(format!("variable '{name}' is reserved"));
        }
        if self.declared.contains_key(name) {
            return Err(format!("variable '{name}' is declared twice"));
        }
        self.declared.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Store a value pulled out of a step result. Extracting the same name
    /// again overwrites it; that is the only way a key changes.
    pub fn extract(&mut self, name: &str, value: Value) {
        self.extracted.insert(name.to_string(), value);
    }

    pub fn extracted(&self) -> &BTreeMap<String, Value> {
        &self.extracted
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.extracted.get(name) {
            return Some(value.clone());
        }
        self.declared.get(name).map(|v| Value::String(v.clone()))
    }

    pub fn set_auth_token(&mut self, token: impl Into<String>) {
        self.auth_token = Some(token.into());
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }
}

impl Variables for Session {
    fn lookup(&self, name: &str) -> Option<String> {
        if name == "base_url" {
            return Some(self.base_url.clone());
        }
        if name == "auth_token" {
            if let Some(token) = &self.auth_token {
                return Some(token.clone());
            }
        }
        self.get(name).map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_declared_names_are_unique() {
        let mut session = Session::new("http://localhost:3000");
        session.declare("provider", "testprovider").unwrap();
        assert!(session.declare("provider", "other").is_err());
        assert!(session.declare("base_url", "x").is_err());
        let err = session.declare("auth_token", "x").unwrap_err();
        assert!(err.contains("reserved"), "{err}");
    }

    #[test]
    fn test_extraction_overwrites_and_shadows() {
        let mut session = Session::new("http://localhost:3000");
        session.declare("id", "seed").unwrap();
        session.extract("id", json!(7));
        assert_eq!(session.lookup("id").as_deref(), Some("7"));

        session.extract("id", json!("abc"));
        assert_eq!(session.lookup("id").as_deref(), Some("abc"));
        assert_eq!(session.extracted().len(), 1);
    }

    #[test]
    fn test_builtin_lookups() {
        let mut session = Session::new("http://localhost:3000");
        assert_eq!(session.lookup("base_url").as_deref(), Some("http://localhost:3000"));
        assert_eq!(session.lookup("auth_token"), None);
        session.set_auth_token("jwt-1");
        assert_eq!(session.lookup("auth_token").as_deref(), Some("jwt-1"));
    }

    #[test]
    fn test_sessions_do_not_share_state() {
        let mut a = Session::new("http://localhost:3000");
        let b = Session::new("http://localhost:3000");
        a.set_auth_token("token-a");
        a.extract("id", json!(1));
        assert_ne!(a.id(), b.id());
        assert_eq!(b.auth_token(), None);
        assert!(b.extracted().is_empty());
    }
}
