//! Trust Applicator
//!
//! Converges one target against the current CA: confirm running, wait for
//! responsiveness, detect the OS, fetch the root, make sure the trust-store
//! package exists, place the certificate, rebuild the trust store, verify.
//! Re-running on an already trusted target rewrites the same file and re-runs
//! the same update, so convergence is idempotent.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::credentials::CredentialAcquirer;
use super::error::{Result, TrustError};
use super::os_profile::{detect_container_os, profile_for, OsFamily, OsProfile};
use super::retry::{poll_until, RetryPolicy};
use super::runtime::ContainerRuntime;
use super::staging::StagedFile;
use super::types::{CaEndpoint, Converged, ExecOutput, TargetKind, TrustTarget};

/// Well-known filename of the root inside container trust stores.
pub const CONTAINER_CERT_NAME: &str = "stepca-root.crt";

/// Converges a target's trust store against a CA
#[async_trait]
pub trait TrustApplicator: Send + Sync {
    async fn converge(&self, target: &TrustTarget, ca: &CaEndpoint) -> Result<Converged>;
}

/// Container flavour of the applicator
pub struct ContainerApplicator {
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Arc<CredentialAcquirer>,
    liveness: RetryPolicy,
    staging_dir: PathBuf,
    dry_run: bool,
}

impl ContainerApplicator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        credentials: Arc<CredentialAcquirer>,
        liveness: RetryPolicy,
    ) -> Self {
        Self {
            runtime,
            credentials,
            liveness,
            staging_dir: std::env::temp_dir(),
            dry_run: false,
        }
    }

    pub fn with_staging_dir(mut self, dir: PathBuf) -> Self {
        self.staging_dir = dir;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self
            .runtime
            .inspect(id)
            .await?
            .map(|d| d.running)
            .unwrap_or(false))
    }

    /// A target that vanished mid-convergence is abandoned, not failed.
    async fn abandon_if_gone(&self, target: &TrustTarget, err: TrustError) -> Result<Converged> {
        match self.is_running(&target.id).await {
            Ok(false) => {
                info!(target = %target, error = %err, "Target stopped during convergence, abandoning");
                Ok(Converged::Skipped)
            }
            _ => Err(err),
        }
    }

    async fn shell(&self, id: &str, script: &str) -> Result<ExecOutput> {
        self.runtime.exec(id, &["sh", "-c", script]).await
    }

    async fn wait_responsive(&self, target: &TrustTarget) -> Result<()> {
        poll_until(
            self.liveness,
            || self.runtime.exec(&target.id, &["true"]),
            |probe: &Result<ExecOutput>| matches!(probe, Ok(output) if output.success()),
        )
        .await
        .map(|_| ())
        .map_err(|e| {
            TrustError::convergence(
                target.to_string(),
                "wait_responsive",
                format!("no response to exec after {} attempts", e.attempts),
            )
        })
    }

    async fn ensure_prerequisite(&self, target: &TrustTarget, profile: &OsProfile) {
        let probe = format!("command -v {}", profile.update_binary);
        match self.shell(&target.id, &probe).await {
            Ok(output) if output.success() => {
                debug!(target = %target, binary = profile.update_binary, "Trust-store tooling present");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target = %target, error = %e, "Could not probe trust-store tooling, trying install");
            }
        }

        info!(target = %target, os = %profile.family, "Installing trust-store package");
        match self.shell(&target.id, profile.package_install).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                target = %target,
                step = "install_prerequisite",
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Package install failed, continuing"
            ),
            Err(e) => warn!(
                target = %target,
                step = "install_prerequisite",
                error = %e,
                "Package install failed, continuing"
            ),
        }
    }

    async fn place_certificate(&self, target: &TrustTarget, profile: &OsProfile, pem: &str) -> Result<()> {
        let mkdir = self
            .runtime
            .exec(&target.id, &["mkdir", "-p", profile.trust_anchor_dir])
            .await?;
        if !mkdir.success() {
            return Err(TrustError::convergence(
                target.to_string(),
                "place_certificate",
                format!("mkdir {} exited {}: {}", profile.trust_anchor_dir, mkdir.exit_code, mkdir.stderr.trim()),
            ));
        }

        let staged = StagedFile::new(&self.staging_dir, "root", pem)?;
        let remote = format!("{}/{}", profile.trust_anchor_dir, CONTAINER_CERT_NAME);
        self.runtime
            .copy_file_into(&target.id, staged.path(), &remote)
            .await
            .map_err(|e| TrustError::convergence(target.to_string(), "place_certificate", e))?;

        debug!(target = %target, path = %remote, "Placed CA certificate");
        Ok(())
    }

    async fn update_trust(&self, target: &TrustTarget, profile: &OsProfile) -> Result<()> {
        let output = self
            .shell(&target.id, profile.trust_update)
            .await
            .map_err(|e| TrustError::convergence(target.to_string(), "trust_update", e))?;

        if !output.success() {
            return Err(TrustError::convergence(
                target.to_string(),
                "trust_update",
                format!("`{}` exited {}: {}", profile.trust_update, output.exit_code, output.stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn verify(&self, target: &TrustTarget, ca: &CaEndpoint) -> bool {
        let url = ca.url("/health");
        let script = format!(
            "curl -fsS --max-time 10 -o /dev/null '{url}' 2>/dev/null || wget -q -T 10 -O /dev/null '{url}'"
        );
        match self.shell(&target.id, &script).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(
                    target = %target,
                    step = "verify",
                    ca = %ca,
                    exit_code = output.exit_code,
                    "Target could not reach the CA over HTTPS after trust update"
                );
                false
            }
            Err(e) => {
                warn!(target = %target, step = "verify", error = %e, "Verification could not run");
                false
            }
        }
    }

    async fn converge_steps(&self, target: &TrustTarget, ca: &CaEndpoint) -> Result<Converged> {
        self.wait_responsive(target).await?;

        let family = detect_container_os(self.runtime.as_ref(), &target.id).await?;
        let profile = match profile_for(family) {
            Some(profile) if family != OsFamily::Unknown => profile,
            _ => return Err(TrustError::UnknownOs(target.to_string())),
        };
        debug!(target = %target, os = %family, "Detected target OS");

        let pem = self
            .credentials
            .get_root_certificate(ca)
            .await
            .map_err(|e| TrustError::convergence(target.to_string(), "fetch_certificate", e))?;

        if self.dry_run {
            info!(
                target = %target,
                os = %family,
                path = %format!("{}/{}", profile.trust_anchor_dir, CONTAINER_CERT_NAME),
                update = profile.trust_update,
                "DRY RUN - would install CA certificate"
            );
            return Ok(Converged::DryRun);
        }

        self.ensure_prerequisite(target, profile).await;
        self.place_certificate(target, profile, &pem).await?;
        self.update_trust(target, profile).await?;

        Ok(if self.verify(target, ca).await {
            Converged::Verified
        } else {
            Converged::Unverified
        })
    }
}

#[async_trait]
impl TrustApplicator for ContainerApplicator {
    async fn converge(&self, target: &TrustTarget, ca: &CaEndpoint) -> Result<Converged> {
        if target.kind != TargetKind::Container {
            return Err(TrustError::convergence(
                target.to_string(),
                "confirm_running",
                "not a container target",
            ));
        }

        if !self.is_running(&target.id).await? {
            info!(target = %target, "Target not running, skipping");
            return Ok(Converged::Skipped);
        }

        match self.converge_steps(target, ca).await {
            Ok(outcome) => {
                info!(target = %target, outcome = %outcome, "Converged");
                Ok(outcome)
            }
            Err(e) => self.abandon_if_gone(target, e).await,
        }
    }
}
