//! Target health check run before the first scenario

use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::http::resolve_url;

/// Poll `GET {base_url}{path}` every 100 ms until it answers 2xx
pub async fn wait_for_healthy(base_url: &str, path: &str, timeout: Duration) -> RunnerResult<()> {
    let health_url = resolve_url(base_url, path);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;

    let start = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;

        match client.get(&health_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("Target is healthy at {}", health_url);
                return Ok(());
            }
            Ok(resp) => {
                warn!("Health check returned {}", resp.status());
            }
            Err(e) => {
                if attempts == 1 {
                    info!("Waiting for {} ...", health_url);
                }
                // Connection refused is expected while the target starts
                if !e.is_connect() {
                    warn!("Health check error: {}", e);
                }
            }
        }

        if start.elapsed() >= timeout {
            return Err(RunnerError::HealthCheck(attempts));
        }
        sleep(Duration::from_millis(100)).await;
    }
}
