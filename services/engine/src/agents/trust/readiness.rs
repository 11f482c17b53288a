//! Readiness Gate
//!
//! step-ca starts in two phases: the HTTPS listener comes up first and the
//! ACME provisioner initialises afterwards. The CA counts as ready only when
//! one attempt sees both a healthy `/health` and an ACME directory that
//! advertises `newNonce`.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::ca_api::CaApi;
use super::error::{Result, TrustError};
use super::retry::{retry, RetryPolicy};

/// The CA answered both checks in one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub attempts: u32,
}

/// Bounded poll until the CA serves health and ACME
pub struct ReadinessGate {
    api: Arc<dyn CaApi>,
    interval: Duration,
}

impl ReadinessGate {
    pub fn new(api: Arc<dyn CaApi>, interval: Duration) -> Self {
        Self { api, interval }
    }

    /// Poll every interval until ready or `budget / interval` attempts are spent.
    pub async fn wait_until_ready(&self, base_url: &str, budget: Duration) -> Result<Ready> {
        let policy = RetryPolicy::from_budget(budget, self.interval);
        info!(
            ca = %base_url,
            max_attempts = policy.max_attempts,
            "Waiting for CA readiness"
        );

        let ready = retry(policy, |attempt| async move {
            self.probe_once(base_url).await.map(|_| Ready { attempts: attempt })
        })
        .await?;

        info!(ca = %base_url, attempts = ready.attempts, "CA is ready");
        Ok(ready)
    }

    /// One attempt: both checks must pass.
    pub async fn probe_once(&self, base_url: &str) -> Result<()> {
        self.api
            .health(base_url)
            .await
            .map_err(|e| TrustError::Http(format!("health check failed: {}", e)))?;

        let directory = self
            .api
            .acme_directory(base_url)
            .await
            .map_err(|e| {
                info!(ca = %base_url, error = %e, "CA healthy but ACME directory unavailable");
                TrustError::Http(format!("ACME directory unavailable: {}", e))
            })?;

        if directory.get("newNonce").is_none() {
            info!(ca = %base_url, "CA healthy but ACME provisioner not initialised yet");
            return Err(TrustError::Http("ACME directory has no newNonce".into()));
        }

        Ok(())
    }
}
