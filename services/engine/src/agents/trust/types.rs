//! Trust Reconciliation Types
//!
//! Core types for the CA identity, trust targets and runtime views.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::OnceCell;

/// Port the step-ca container serves its API on.
pub const CA_PORT: u16 = 9000;

/// Marker every PEM certificate carries.
pub const PEM_CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
pub const PEM_CERT_END: &str = "-----END CERTIFICATE-----";

/// Resolved identity of the certificate authority for one reconciliation pass.
///
/// Immutable once built. A new pass resolves a fresh endpoint so a CA restart
/// with a new container id is picked up.
#[derive(Debug)]
pub struct CaEndpoint {
    /// Runtime container id, `None` when the CA came from an explicit override.
    pub container_id: Option<String>,
    pub display_name: String,
    pub base_url: String,
    /// Hex SHA-256 of the root certificate (DER).
    pub fingerprint: Fingerprint,
    root_certificate: OnceCell<String>,
}

impl CaEndpoint {
    /// Endpoint for a discovered CA container; the URL is derived from its name.
    pub fn discovered(container_id: &str, display_name: &str, fingerprint: Fingerprint) -> Self {
        Self {
            container_id: Some(container_id.to_string()),
            display_name: display_name.to_string(),
            base_url: base_url_for(display_name),
            fingerprint,
            root_certificate: OnceCell::new(),
        }
    }

    /// Endpoint for an explicit URL + fingerprint override.
    pub fn from_override(base_url: &str, fingerprint: Fingerprint) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            container_id: None,
            display_name: host_of(&base_url).to_string(),
            base_url,
            fingerprint,
            root_certificate: OnceCell::new(),
        }
    }

    /// Root certificate cell, filled on first use by the credential acquirer.
    pub(crate) fn root_cell(&self) -> &OnceCell<String> {
        &self.root_certificate
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl fmt::Display for CaEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.base_url)
    }
}

/// `https://<name>:9000`
pub fn base_url_for(display_name: &str) -> String {
    format!("https://{}:{}", display_name.trim_start_matches('/'), CA_PORT)
}

fn host_of(url: &str) -> &str {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority)
}

/// Normalised certificate fingerprint (lowercase hex, no separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Accepts `AB:CD:..`, `abcd..` and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalised: String = raw
            .trim()
            .chars()
            .filter(|c| *c != ':')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        if normalised.len() == 64 && normalised.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(normalised))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a trust target is a container or the operator's host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Container,
    Host,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Container => write!(f, "container"),
            TargetKind::Host => write!(f, "host"),
        }
    }
}

/// A container or host that should trust the CA.
///
/// Enumerated fresh on every trigger firing, never cached across passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustTarget {
    pub id: String,
    pub display_name: String,
    pub kind: TargetKind,
    /// Runtime id for containers, `<user>-<context>` for hosts.
    pub identity_key: String,
}

impl TrustTarget {
    pub fn container(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: name.trim_start_matches('/').to_string(),
            kind: TargetKind::Container,
            identity_key: id.to_string(),
        }
    }

    /// Host target; user and context are escaped so the key stays unambiguous.
    pub fn host(user: &str, context: &str) -> Self {
        let identity_key = format!("{}-{}", escape_identity(user), escape_identity(context));
        Self {
            id: identity_key.clone(),
            display_name: format!("host:{}@{}", user, context),
            kind: TargetKind::Host,
            identity_key,
        }
    }
}

/// Keep `[A-Za-z0-9.]`, write every other byte as `_xx`.
///
/// `-` and `_` are always escaped, so `<user>-<context>` splits back uniquely.
pub fn escape_identity(component: &str) -> String {
    let mut escaped = String::with_capacity(component.len());
    for byte in component.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("_{:02x}", byte));
        }
    }
    escaped
}

impl fmt::Display for TrustTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.display_name)
    }
}

/// One row of a container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

/// Full view of one container from an inspect call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// `KEY=VALUE` pairs split at the first `=`.
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    /// Container-side ports that have a host binding.
    pub published_ports: Vec<u16>,
}

impl ContainerDetail {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_env_prefix(&self, prefix: &str) -> bool {
        self.env.iter().any(|(k, _)| k.starts_with(prefix))
    }

    pub fn publishes_port(&self, port: u16) -> bool {
        self.published_ports.contains(&port)
    }
}

/// Selection criteria for a container listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// `(key, Some(value))` matches key=value, `(key, None)` key presence.
    pub label: Option<(String, Option<String>)>,
    /// Substring match on the name, as the runtime's own name filter does.
    pub name: Option<String>,
    pub running_only: bool,
}

impl ContainerFilter {
    pub fn running() -> Self {
        Self {
            running_only: true,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: Option<&str>) -> Self {
        self.label = Some((key.to_string(), value.map(str::to_string)));
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// A lifecycle event from the runtime's event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub name: String,
    pub action: String,
}

/// Which event types a stream subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub actions: Vec<String>,
}

impl EventFilter {
    pub fn starts() -> Self {
        Self {
            actions: vec!["start".to_string()],
        }
    }
}

/// Captured result of a command executed inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Which trigger source produced a piece of convergence work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Bootstrap,
    Event,
    Sweep,
    ContextChange,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Bootstrap => write!(f, "bootstrap"),
            TriggerSource::Event => write!(f, "event"),
            TriggerSource::Sweep => write!(f, "sweep"),
            TriggerSource::ContextChange => write!(f, "context_change"),
        }
    }
}

/// Outcome of converging one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Converged {
    /// Certificate placed, trust updated and the target reached the CA over HTTPS.
    Verified,
    /// Certificate placed and trust updated, verification did not succeed.
    Unverified,
    /// Target was no longer running.
    Skipped,
    /// Dry run: nothing was written.
    DryRun,
}

impl fmt::Display for Converged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Converged::Verified => write!(f, "verified"),
            Converged::Unverified => write!(f, "unverified"),
            Converged::Skipped => write!(f, "skipped"),
            Converged::DryRun => write!(f, "dry_run"),
        }
    }
}

/// Whether an env value turns the opt-in flag on
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
