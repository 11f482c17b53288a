//! Error types for trust reconciliation

use thiserror::Error;

/// Result type for trust reconciliation operations
pub type Result<T> = std::result::Result<T, TrustError>;

/// Errors that can occur while reconciling trust
#[derive(Debug, Error)]
pub enum TrustError {
    /// The container runtime could not be reached at all
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A runtime command ran but failed
    #[error("Runtime command failed: {0}")]
    Command(String),

    /// A call to the CA's HTTP API failed
    #[error("CA API error: {0}")]
    Http(String),

    /// No container could be identified as the CA
    #[error("CA container not found")]
    NotFound,

    /// The CA never became ready within the budget
    #[error("CA not ready after {attempts} attempts: {last_error}")]
    Timeout { attempts: u32, last_error: String },

    /// Both primary and fallback credential methods failed
    #[error("Credential acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// One target's convergence failed at a required step
    #[error("Convergence of {target} failed at {step}: {reason}")]
    ConvergenceFailed {
        target: String,
        step: &'static str,
        reason: String,
    },

    /// The target's OS family could not be detected
    #[error("Unknown OS on {0}")]
    UnknownOs(String),

    /// Unrecoverable configuration problem
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TrustError {
    pub fn convergence(target: impl Into<String>, step: &'static str, reason: impl ToString) -> Self {
        TrustError::ConvergenceFailed {
            target: target.into(),
            step,
            reason: reason.to_string(),
        }
    }

    /// Whether this error ends the current reconciliation pass.
    ///
    /// Per-target failures never end a pass.
    pub fn is_fatal_for_pass(&self) -> bool {
        matches!(
            self,
            TrustError::RuntimeUnavailable(_)
                | TrustError::NotFound
                | TrustError::Timeout { .. }
                | TrustError::AcquisitionFailed(_)
        )
    }

    /// Whether retrying on the next trigger may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TrustError::Config(_))
    }

    /// Short machine-readable label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TrustError::RuntimeUnavailable(_) => "runtime_unavailable",
            TrustError::Command(_) => "command",
            TrustError::Http(_) => "http",
            TrustError::NotFound => "not_found",
            TrustError::Timeout { .. } => "timeout",
            TrustError::AcquisitionFailed(_) => "acquisition_failed",
            TrustError::ConvergenceFailed { .. } => "convergence_failed",
            TrustError::UnknownOs(_) => "unknown_os",
            TrustError::Config(_) => "config",
        }
    }
}
