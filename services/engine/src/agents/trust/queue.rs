//! Convergence queue
//!
//! Every trigger publishes work items onto one bounded channel; a fixed pool
//! of workers drains it. Duplicate items for the same target are fine since
//! convergence is idempotent.

use async_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::applicator::TrustApplicator;
use super::error::{Result, TrustError};
use super::status::{ConvergenceReport, StatusBoard};
use super::types::{CaEndpoint, TriggerSource, TrustTarget};

/// One target to converge against one CA
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub target: TrustTarget,
    pub ca: Arc<CaEndpoint>,
    pub trigger: TriggerSource,
}

/// Producer side, cloned into every trigger
#[derive(Clone)]
pub struct ConvergenceQueue {
    tx: Sender<WorkItem>,
}

impl ConvergenceQueue {
    /// Create the channel and spawn `workers` consumers.
    pub fn start(
        applicator: Arc<dyn TrustApplicator>,
        board: Arc<StatusBoard>,
        workers: usize,
        capacity: usize,
    ) -> (Self, WorkerPool) {
        let (tx, rx) = bounded(capacity.max(1));
        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    rx.clone(),
                    applicator.clone(),
                    board.clone(),
                ))
            })
            .collect();

        (Self { tx }, WorkerPool { handles })
    }

    /// Waits for room when the queue is full.
    pub async fn submit(&self, item: WorkItem) -> Result<()> {
        debug!(target = %item.target, trigger = %item.trigger, "Queueing convergence");
        self.tx
            .send(item)
            .await
            .map_err(|_| TrustError::Command("convergence queue is closed".into()))
    }

    /// Stop accepting work; workers finish what is queued and exit.
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Handles of the worker tasks
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Wait for every worker to drain the closed queue.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Convergence worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    rx: Receiver<WorkItem>,
    applicator: Arc<dyn TrustApplicator>,
    board: Arc<StatusBoard>,
) {
    debug!(worker, "Convergence worker started");

    while let Ok(item) = rx.recv().await {
        let result = applicator.converge(&item.target, &item.ca).await;

        match &result {
            Ok(outcome) => debug!(
                worker,
                target = %item.target,
                trigger = %item.trigger,
                outcome = %outcome,
                "Convergence finished"
            ),
            Err(TrustError::ConvergenceFailed { step, reason, .. }) => warn!(
                worker,
                target = %item.target,
                trigger = %item.trigger,
                step = *step,
                reason = %reason,
                "Convergence failed"
            ),
            Err(e) => warn!(
                worker,
                target = %item.target,
                trigger = %item.trigger,
                error = %e,
                "Convergence failed"
            ),
        }

        let report = ConvergenceReport::new(&item.target, item.trigger, &item.ca.display_name, &result);
        board.record_target(&item.target.identity_key, report).await;
    }

    info!(worker, "Convergence worker stopped");
}
