//! Host trust
//!
//! The host variant installs the CA's intermediate certificate into the
//! operator machine's trust store. Each record is named after the user and the
//! active runtime context, so several operators or contexts never overwrite
//! each other's anchors.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::applicator::TrustApplicator;
use super::ca_api::CaApi;
use super::credentials::CredentialAcquirer;
use super::error::{Result, TrustError};
use super::os_profile::{
    detect_from_package_managers, detect_from_release, profile_for, OsFamily, OsProfile,
    PACKAGE_MANAGER_RULES, RELEASE_FILES,
};
use super::staging::StagedFile;
use super::types::{CaEndpoint, Converged, ExecOutput, TargetKind, TrustTarget};

const HOST_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// `<prefix>-<user>-<context>.crt`, with both components escaped.
pub fn host_record_name(prefix: &str, target: &TrustTarget) -> String {
    format!("{}-{}.crt", prefix, target.identity_key)
}

/// The operator machine as seen by the host applicator
#[async_trait]
pub trait HostSystem: Send + Sync {
    async fn read_file(&self, path: &str) -> Option<String>;

    async fn binary_exists(&self, name: &str) -> bool;

    /// Atomically place `content` at `path`, creating the directory if needed.
    async fn install_file(&self, path: &Path, content: &str, use_sudo: bool) -> Result<()>;

    async fn run_shell(&self, script: &str, use_sudo: bool) -> Result<ExecOutput>;
}

/// The machine this process runs on
pub struct LocalHost;

impl LocalHost {
    async fn run(&self, program: &str, args: &[&str], use_sudo: bool) -> Result<ExecOutput> {
        let mut command = if use_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(program);
            c
        } else {
            Command::new(program)
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(HOST_COMMAND_TIMEOUT, command.output())
            .await
            .map_err(|_| TrustError::Command(format!("{} timed out", program)))?
            .map_err(|e| TrustError::Command(format!("failed to run {}: {}", program, e)))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }
}

#[async_trait]
impl HostSystem for LocalHost {
    async fn read_file(&self, path: &str) -> Option<String> {
        tokio::fs::read_to_string(path).await.ok()
    }

    async fn binary_exists(&self, name: &str) -> bool {
        let Some(path) = std::env::var_os("PATH") else {
            return false;
        };
        for dir in std::env::split_paths(&path) {
            if let Ok(meta) = tokio::fs::metadata(dir.join(name)).await {
                if meta.is_file() {
                    return true;
                }
            }
        }
        false
    }

    async fn install_file(&self, path: &Path, content: &str, use_sudo: bool) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| TrustError::Command(format!("{} has no parent directory", path.display())))?;

        if use_sudo {
            let staged = StagedFile::in_temp_dir("host", content)?;
            let target = path.display().to_string();
            let output = self
                .run(
                    "install",
                    &["-D", "-m", "0644", &staged.path().display().to_string(), &target],
                    true,
                )
                .await?;
            if !output.success() {
                return Err(TrustError::Command(format!(
                    "sudo install {} exited {}: {}",
                    target,
                    output.exit_code,
                    output.stderr.trim()
                )));
            }
            return Ok(());
        }

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TrustError::Command(format!("create {}: {}", dir.display(), e)))?;
        let partial = path.with_extension("crt.partial");
        tokio::fs::write(&partial, content)
            .await
            .map_err(|e| TrustError::Command(format!("write {}: {}", partial.display(), e)))?;
        tokio::fs::rename(&partial, path)
            .await
            .map_err(|e| TrustError::Command(format!("rename into {}: {}", path.display(), e)))
    }

    async fn run_shell(&self, script: &str, use_sudo: bool) -> Result<ExecOutput> {
        self.run("sh", &["-c", script], use_sudo).await
    }
}

/// Release files first, then whichever package manager is on `PATH`.
pub async fn detect_host_os(system: &dyn HostSystem) -> OsFamily {
    for path in RELEASE_FILES {
        if let Some(text) = system.read_file(path).await {
            let family = detect_from_release(&text);
            if family != OsFamily::Unknown {
                return family;
            }
        }
    }

    let mut present = Vec::new();
    for (binary, _) in PACKAGE_MANAGER_RULES {
        if system.binary_exists(binary).await {
            present.push(binary);
        }
    }
    detect_from_package_managers(&present)
}

/// Host flavour of the applicator
pub struct HostApplicator {
    system: Arc<dyn HostSystem>,
    credentials: Arc<CredentialAcquirer>,
    api: Arc<dyn CaApi>,
    prefix: String,
    use_sudo: bool,
    dry_run: bool,
}

impl HostApplicator {
    pub fn new(
        system: Arc<dyn HostSystem>,
        credentials: Arc<CredentialAcquirer>,
        api: Arc<dyn CaApi>,
        prefix: &str,
    ) -> Self {
        Self {
            system,
            credentials,
            api,
            prefix: prefix.to_string(),
            use_sudo: false,
            dry_run: false,
        }
    }

    pub fn use_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn record_path(&self, profile: &OsProfile, target: &TrustTarget) -> PathBuf {
        Path::new(profile.trust_anchor_dir).join(host_record_name(&self.prefix, target))
    }

    async fn ensure_prerequisite(&self, profile: &OsProfile) {
        if self.system.binary_exists(profile.update_binary).await {
            return;
        }
        info!(os = %profile.family, "Installing trust-store package on host");
        match self.system.run_shell(profile.package_install, self.use_sudo).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                step = "install_prerequisite",
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Host package install failed, continuing"
            ),
            Err(e) => warn!(step = "install_prerequisite", error = %e, "Host package install failed, continuing"),
        }
    }
}

#[async_trait]
impl TrustApplicator for HostApplicator {
    async fn converge(&self, target: &TrustTarget, ca: &CaEndpoint) -> Result<Converged> {
        if target.kind != TargetKind::Host {
            return Err(TrustError::convergence(target.to_string(), "detect_os", "not a host target"));
        }

        let family = detect_host_os(self.system.as_ref()).await;
        let profile = match profile_for(family) {
            Some(profile) => profile,
            None => return Err(TrustError::UnknownOs(target.to_string())),
        };
        debug!(target = %target, os = %family, "Detected host OS");

        let pem = self
            .credentials
            .get_intermediate_certificate(ca)
            .await
            .map_err(|e| TrustError::convergence(target.to_string(), "fetch_certificate", e))?;

        let record = self.record_path(profile, target);
        if self.dry_run {
            info!(
                target = %target,
                path = %record.display(),
                update = profile.trust_update,
                "DRY RUN - would install CA intermediate on host"
            );
            return Ok(Converged::DryRun);
        }

        self.ensure_prerequisite(profile).await;

        self.system
            .install_file(&record, &pem, self.use_sudo)
            .await
            .map_err(|e| TrustError::convergence(target.to_string(), "place_certificate", e))?;
        debug!(target = %target, path = %record.display(), "Placed host trust record");

        let output = self
            .system
            .run_shell(profile.trust_update, self.use_sudo)
            .await
            .map_err(|e| TrustError::convergence(target.to_string(), "trust_update", e))?;
        if !output.success() {
            return Err(TrustError::convergence(
                target.to_string(),
                "trust_update",
                format!("`{}` exited {}: {}", profile.trust_update, output.exit_code, output.stderr.trim()),
            ));
        }

        let outcome = match self.api.verify_trusted(&ca.base_url).await {
            Ok(()) => Converged::Verified,
            Err(e) => {
                warn!(target = %target, step = "verify", ca = %ca, error = %e, "Host does not trust the CA yet");
                Converged::Unverified
            }
        };
        info!(target = %target, outcome = %outcome, path = %record.display(), "Converged host");
        Ok(outcome)
    }
}
