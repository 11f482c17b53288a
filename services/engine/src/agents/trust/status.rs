//! Status board
//!
//! Last outcome per target and per pass, kept in memory and served read-only
//! over HTTP when a status address is configured.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use super::error::TrustError;
use super::types::{Converged, TargetKind, TriggerSource, TrustTarget};

/// Result of one target's convergence
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub target: String,
    pub kind: TargetKind,
    pub trigger: TriggerSource,
    pub ca: String,
    /// `verified`, `unverified`, `skipped`, `dry_run` or `failed`.
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl ConvergenceReport {
    pub fn new(
        target: &TrustTarget,
        trigger: TriggerSource,
        ca: &str,
        result: &std::result::Result<Converged, TrustError>,
    ) -> Self {
        let (outcome, error_kind, step, reason) = match result {
            Ok(converged) => (converged.to_string(), None, None, None),
            Err(TrustError::ConvergenceFailed { step, reason, .. }) => (
                "failed".to_string(),
                Some("convergence_failed"),
                Some(*step),
                Some(reason.clone()),
            ),
            Err(e) => ("failed".to_string(), Some(e.kind()), None, Some(e.to_string())),
        };

        Self {
            target: target.display_name.clone(),
            kind: target.kind,
            trigger,
            ca: ca.to_string(),
            outcome,
            error_kind,
            step,
            reason,
            at: Utc::now(),
        }
    }

    pub fn failed(&self) -> bool {
        self.outcome == "failed"
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub trigger: TriggerSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    pub queued: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Counters {
    pub passes: u64,
    pub skipped_passes: u64,
    pub converged: u64,
    pub failed: u64,
}

/// Snapshot served at `/api/trust/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub counters: Counters,
    pub last_pass: Option<PassReport>,
    pub targets: Vec<ConvergenceReport>,
}

/// In-memory outcome store shared by workers and triggers
#[derive(Default)]
pub struct StatusBoard {
    targets: RwLock<BTreeMap<String, ConvergenceReport>>,
    last_pass: RwLock<Option<PassReport>>,
    passes: AtomicU64,
    skipped_passes: AtomicU64,
    converged: AtomicU64,
    failed: AtomicU64,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_target(&self, identity_key: &str, report: ConvergenceReport) {
        if report.failed() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.converged.fetch_add(1, Ordering::Relaxed);
        }
        self.targets
            .write()
            .await
            .insert(identity_key.to_string(), report);
    }

    /// Drop reports for targets outside the latest enumeration.
    pub async fn retain_targets(&self, live: &HashSet<&str>) -> usize {
        let mut targets = self.targets.write().await;
        let before = targets.len();
        targets.retain(|key, _| live.contains(key.as_str()));
        before - targets.len()
    }

    pub async fn record_pass(&self, report: PassReport) {
        if report.error.is_some() {
            self.skipped_passes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.passes.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_pass.write().await = Some(report);
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub async fn target(&self, identity_key: &str) -> Option<ConvergenceReport> {
        self.targets.read().await.get(identity_key).cloned()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            counters: Counters {
                passes: self.passes.load(Ordering::Relaxed),
                skipped_passes: self.skipped_passes.load(Ordering::Relaxed),
                converged: self.converged.load(Ordering::Relaxed),
                failed: self.failed.load(Ordering::Relaxed),
            },
            last_pass: self.last_pass.read().await.clone(),
            targets: self.targets.read().await.values().cloned().collect(),
        }
    }
}

/// Read-only status API
pub fn router(board: Arc<StatusBoard>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/trust/status", get(trust_status))
        .layer(TraceLayer::new_for_http())
        .with_state(board)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "stepca-trust-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn trust_status(State(board): State<Arc<StatusBoard>>) -> Json<StatusSnapshot> {
    Json(board.snapshot().await)
}
