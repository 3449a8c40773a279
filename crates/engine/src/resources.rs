//! Per-scenario resources and their release

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::browser::{BrowserContext, BrowserDriver, ContextOptions};
use crate::error::{RunnerError, RunnerResult};
use crate::http::HttpSession;

/// Counts handles (HTTP sessions, browser contexts) that are still open
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    open: Arc<AtomicUsize>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, kind: &'static str) -> HandleGuard {
        self.open.fetch_add(1, Ordering::SeqCst);
        HandleGuard {
            open: self.open.clone(),
            kind,
        }
    }

    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

/// Decrements the tracker when dropped
#[derive(Debug)]
pub struct HandleGuard {
    open: Arc<AtomicUsize>,
    kind: &'static str,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        debug!("Released {}", self.kind);
    }
}

/// Resources owned by one scenario run: its HTTP session and, if any step
/// needs one, a private browser context
pub struct ScenarioResources {
    http: HttpSession,
    browser: Option<Box<dyn BrowserContext>>,
    http_guard: Option<HandleGuard>,
    browser_guard: Option<HandleGuard>,
}

impl ScenarioResources {
    pub async fn acquire(
        scenario: &str,
        driver: Option<&Arc<dyn BrowserDriver>>,
        options: Option<&ContextOptions>,
        tracker: &ResourceTracker,
    ) -> RunnerResult<Self> {
        let acquisition = |reason: String| RunnerError::ResourceAcquisition {
            scenario: scenario.to_string(),
            reason,
        };

        let http = HttpSession::new().map_err(|e| acquisition(e.to_string()))?;
        let http_guard = tracker.acquire("http session");

        let (browser, browser_guard) = match options {
            Some(options) => {
                let driver = driver.ok_or_else(|| {
                    acquisition("scenario needs a browser but none is configured".into())
                })?;
                let context = driver
                    .new_context(options)
                    .await
                    .map_err(|e| acquisition(e.to_string()))?;
                debug!("Scenario '{}' got browser context {}", scenario, context.id());
                (Some(context), Some(tracker.acquire("browser context")))
            }
            None => (None, None),
        };

        Ok(Self {
            http,
            browser,
            http_guard: Some(http_guard),
            browser_guard,
        })
    }

    pub fn http(&self) -> &HttpSession {
        &self.http
    }

    pub fn browser(&self) -> Option<&dyn BrowserContext> {
        self.browser.as_deref()
    }

    /// Close everything. Failures are returned, not raised.
    pub async fn release(mut self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(context) = self.browser.take() {
            if let Err(e) = context.close().await {
                warn!("Failed to close browser context {}: {}", context.id(), e);
                errors.push(format!("close browser context {}: {}", context.id(), e));
            }
        }
        self.browser_guard.take();
        self.http_guard.take();
        errors
    }
}

impl Drop for ScenarioResources {
    // Reached only when `release` was skipped (the run future was dropped)
    fn drop(&mut self) {
        if let Some(context) = self.browser.take() {
            let guard = self.browser_guard.take();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = context.close().await {
                            warn!("Failed to close browser context {}: {}", context.id(), e);
                        }
                        drop(guard);
                    });
                }
                Err(_) => warn!("Browser context {} dropped outside a runtime", context.id()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_track_open_handles() {
        let tracker = ResourceTracker::new();
        let a = tracker.acquire("http session");
        let b = tracker.acquire("browser context");
        assert_eq!(tracker.open_handles(), 2);
        drop(a);
        assert_eq!(tracker.open_handles(), 1);
        drop(b);
        assert_eq!(tracker.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_release_without_browser() {
        let tracker = ResourceTracker::new();
        let resources = ScenarioResources::acquire("api-only", None, None, &tracker)
            .await
            .unwrap();
        assert!(resources.browser().is_none());
        assert_eq!(tracker.open_handles(), 1);

        let errors = resources.release().await;
        assert!(errors.is_empty());
        assert_eq!(tracker.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_browser_required_without_driver() {
        let tracker = ResourceTracker::new();
        let options = ContextOptions {
            viewport_width: 1280,
            viewport_height: 720,
            default_timeout: std::time::Duration::from_secs(5),
            locator_policy: Default::default(),
        };
        let err = ScenarioResources::acquire("ui", None, Some(&options), &tracker)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::ResourceAcquisition { .. }));
        assert_eq!(tracker.open_handles(), 0);
    }
}
