//! The readiness waiter: the single place where the engine blocks for an
//! extended time. A pod counts as ready when its phase is Running, its Ready
//! condition is True, and the agent's health endpoint answers 200 through
//! the service.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::orchestrator::Orchestrator;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const TOTAL_TIMEOUT: Duration = Duration::from_secs(120);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drain budget when scaling to zero; best-effort per the deactivation
/// contract.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn wait_ready(
    orch: &Orchestrator,
    http: &reqwest::Client,
    namespace: &str,
    selector: &str,
    health_url: &str,
    cancel: &CancellationToken,
) -> Result<(), ApiError> {
    let deadline = Instant::now() + TOTAL_TIMEOUT;
    let mut last_failure = "no pods observed yet".to_string();

    loop {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled("readiness wait cancelled".to_string()));
        }

        match orch.get_pod_status(namespace, selector).await {
            Ok(pods) => {
                let ready = pods.iter().any(|p| p.phase == "Running" && p.ready);
                if ready {
                    match probe_health(http, health_url).await {
                        Ok(()) => return Ok(()),
                        Err(reason) => last_failure = reason,
                    }
                } else if let Some(pod) = pods.first() {
                    last_failure = format!("pod {} is {} (ready={})", pod.name, pod.phase, pod.ready);
                } else {
                    last_failure = "no pods scheduled yet".to_string();
                }
            }
            Err(e) => last_failure = e.to_string(),
        }

        if Instant::now() + POLL_INTERVAL > deadline {
            return Err(ApiError::ReadinessTimeout(last_failure));
        }
        aviary_common::wait::sleep_cancellable(cancel, POLL_INTERVAL)
            .await
            .map_err(|e| ApiError::Cancelled(e.to_string()))?;
    }
}

async fn probe_health(http: &reqwest::Client, health_url: &str) -> Result<(), String> {
    let resp = http
        .get(health_url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|e| format!("health probe failed: {}", e))?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("health probe returned {}", resp.status()))
    }
}

/// Poll until no pods match the selector, or the drain budget elapses.
/// Returns whether the pods were observed gone.
pub async fn wait_drained(
    orch: &Orchestrator,
    namespace: &str,
    selector: &str,
    cancel: &CancellationToken,
) -> Result<bool, ApiError> {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let pods = orch.get_pod_status(namespace, selector).await?;
        if pods.is_empty() {
            return Ok(true);
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            return Ok(false);
        }
        aviary_common::wait::sleep_cancellable(cancel, POLL_INTERVAL)
            .await
            .map_err(|e| ApiError::Cancelled(e.to_string()))?;
    }
}
