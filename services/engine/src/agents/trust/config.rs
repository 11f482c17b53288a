//! Configuration for trust reconciliation.
//!
//! Values come from CLI flags / environment in the binaries and are passed
//! down explicitly; nothing in the library reads the environment.

use std::time::Duration;

use super::error::{Result, TrustError};
use super::types::Fingerprint;

/// Interval between readiness attempts.
pub const READINESS_INTERVAL: Duration = Duration::from_secs(5);

/// Inputs to CA discovery and readiness.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Explicit CA container name (declared-name tier).
    pub container_name: Option<String>,
    /// Explicit CA URL; with `fingerprint` it bypasses discovery entirely.
    pub ca_url: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    /// Readiness budget for the bootstrap pass.
    pub bootstrap_timeout: Duration,
    /// Readiness budget for background passes.
    pub reconcile_timeout: Duration,
    pub readiness_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            container_name: None,
            ca_url: None,
            fingerprint: None,
            bootstrap_timeout: Duration::from_secs(120),
            reconcile_timeout: Duration::from_secs(30),
            readiness_interval: READINESS_INTERVAL,
        }
    }
}

/// The explicit short-circuit: both URL and fingerprint configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitCa {
    pub url: String,
    pub fingerprint: Fingerprint,
}

impl DiscoveryConfig {
    /// Returns the override when both halves are present.
    ///
    /// A lone URL or lone fingerprint does not bypass discovery.
    pub fn explicit_ca(&self) -> Option<ExplicitCa> {
        match (&self.ca_url, &self.fingerprint) {
            (Some(url), Some(fingerprint)) if !url.trim().is_empty() => Some(ExplicitCa {
                url: url.trim().to_string(),
                fingerprint: fingerprint.clone(),
            }),
            _ => None,
        }
    }

    /// Parse a raw fingerprint string from the environment.
    pub fn with_raw_fingerprint(mut self, raw: Option<&str>) -> Result<Self> {
        self.fingerprint = match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                Fingerprint::parse(raw)
                    .ok_or_else(|| TrustError::Config(format!("malformed CA fingerprint: {}", raw)))?,
            ),
            None => None,
        };
        Ok(self)
    }
}

/// Settings for the container-trust daemon.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub discovery: DiscoveryConfig,
    /// Env var a container sets to a truthy value to opt in.
    pub opt_in_flag: String,
    pub sweep_interval: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Budget for the target liveness probe.
    pub target_ready_timeout: Duration,
    pub target_ready_interval: Duration,
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            opt_in_flag: "STEP_CA_TRUST".to_string(),
            sweep_interval: Duration::from_secs(300),
            workers: 4,
            queue_capacity: 256,
            target_ready_timeout: Duration::from_secs(20),
            target_ready_interval: Duration::from_secs(2),
            dry_run: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.opt_in_flag.trim().is_empty() || self.opt_in_flag.contains('=') {
            return Err(TrustError::Config(format!(
                "invalid opt-in variable name: {:?}",
                self.opt_in_flag
            )));
        }
        if self.workers == 0 {
            return Err(TrustError::Config("at least one worker is required".into()));
        }
        if self.queue_capacity == 0 {
            return Err(TrustError::Config("queue capacity must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(TrustError::Config("sweep interval must be positive".into()));
        }
        if self.discovery.readiness_interval.is_zero() {
            return Err(TrustError::Config("readiness interval must be positive".into()));
        }
        if self.target_ready_timeout >= self.discovery.bootstrap_timeout {
            return Err(TrustError::Config(
                "target liveness budget must be shorter than the CA readiness budget".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for the host-trust daemon.
#[derive(Debug, Clone)]
pub struct HostTrustConfig {
    pub discovery: DiscoveryConfig,
    /// Filename stem prefix of host trust records.
    pub prefix: String,
    pub user: String,
    /// Prefix mutating host commands with `sudo -n`.
    pub use_sudo: bool,
    /// Fallback re-read interval for the active context.
    pub poll_interval: Duration,
    /// Periodic re-convergence interval.
    pub sweep_interval: Duration,
    pub dry_run: bool,
}

impl HostTrustConfig {
    pub fn new(user: &str) -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            prefix: "stepca".to_string(),
            user: user.to_string(),
            use_sudo: false,
            poll_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(300),
            dry_run: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() || self.prefix.contains('/') {
            return Err(TrustError::Config(format!(
                "invalid trust record prefix: {:?}",
                self.prefix
            )));
        }
        if self.user.trim().is_empty() {
            return Err(TrustError::Config("host user is empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(TrustError::Config("poll interval must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(TrustError::Config("sweep interval must be positive".into()));
        }
        Ok(())
    }
}
