//! Browser automation seam
//!
//! A `BrowserDriver` is one browser engine shared by every lane. Each
//! scenario gets its own `BrowserContext` (a private browsing session), so
//! cookies and storage never cross scenarios.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LocatorPolicy;
use crate::error::{ActionError, BrowserError};
use crate::locator::Locator;

pub mod playwright;

pub use playwright::PlaywrightDriver;

/// Page load state a navigation waits for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// Network response received and document started loading
    Commit,
    #[default]
    DomContentLoaded,
    Load,
    NetworkIdle,
}

impl LoadState {
    /// Playwright's `waitUntil` name
    pub fn as_playwright(&self) -> &'static str {
        match self {
            LoadState::Commit => "commit",
            LoadState::DomContentLoaded => "domcontentloaded",
            LoadState::Load => "load",
            LoadState::NetworkIdle => "networkidle",
        }
    }
}

/// Outcome of a navigation. A timeout here is not fatal: load-state waits
/// are best effort and the page is usually usable anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    Loaded { url: String },
    TimedOut { url: String },
}

/// Options for a new browsing context
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub default_timeout: Duration,
    pub locator_policy: LocatorPolicy,
}

/// A browser engine able to create isolated contexts
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn new_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Box<dyn BrowserContext>, BrowserError>;

    /// Stop the engine; contexts still open are closed with it
    async fn shutdown(&self) -> Result<(), BrowserError>;
}

/// One private browsing session with a single page
#[async_trait]
pub trait BrowserContext: Send + Sync {
    fn id(&self) -> &str;

    async fn navigate(
        &self,
        url: &str,
        wait_until: LoadState,
        timeout: Duration,
    ) -> Result<NavigationOutcome, ActionError>;

    /// Resolve `locator` (main document first, then frames) and click it
    async fn click(&self, locator: &Locator, timeout: Duration) -> Result<(), ActionError>;

    async fn fill(
        &self,
        locator: &Locator,
        value: &str,
        timeout: Duration,
    ) -> Result<(), ActionError>;

    /// Whether the locator currently resolves to a visible element
    async fn is_visible(&self, locator: &Locator) -> Result<bool, ActionError>;

    async fn text(&self, locator: &Locator, timeout: Duration) -> Result<String, ActionError>;

    async fn current_url(&self) -> Result<String, ActionError>;

    /// Dispose the context. Calling it twice is harmless.
    async fn close(&self) -> Result<(), ActionError>;
}
