//! Reconciler
//!
//! One pass: locate the CA (explicit override or discovery), gate on
//! readiness, acquire the fingerprint, enumerate targets and queue one work
//! item per target. Everything is re-resolved on every pass so a restarted CA
//! or a changed fleet is picked up.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::ca_api::CaApi;
use super::config::{DiscoveryConfig, ExplicitCa};
use super::credentials::CredentialAcquirer;
use super::error::{Result, TrustError};
use super::queue::{ConvergenceQueue, WorkItem};
use super::readiness::ReadinessGate;
use super::resolver::{CaResolver, ResolvedCa};
use super::runtime::ContainerRuntime;
use super::status::{PassReport, StatusBoard};
use super::types::{
    base_url_for, is_truthy, CaEndpoint, ContainerEvent, ContainerFilter, TriggerSource, TrustTarget,
};

/// Where this pass found the CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaLocation {
    Explicit(ExplicitCa),
    Container(ResolvedCa),
}

impl CaLocation {
    pub fn container_id(&self) -> Option<&str> {
        match self {
            CaLocation::Explicit(_) => None,
            CaLocation::Container(resolved) => Some(&resolved.container_id),
        }
    }
}

/// Turns configuration and the live fleet into a `CaEndpoint`
pub struct CaReconciler {
    resolver: CaResolver,
    readiness: ReadinessGate,
    credentials: Arc<CredentialAcquirer>,
    discovery: DiscoveryConfig,
}

impl CaReconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        api: Arc<dyn CaApi>,
        credentials: Arc<CredentialAcquirer>,
        discovery: DiscoveryConfig,
    ) -> Self {
        Self {
            resolver: CaResolver::new(runtime, discovery.container_name.clone()),
            readiness: ReadinessGate::new(api, discovery.readiness_interval),
            credentials,
            discovery,
        }
    }

    pub fn discovery(&self) -> &DiscoveryConfig {
        &self.discovery
    }

    /// Explicit override when fully configured, discovery otherwise.
    pub async fn locate(&self) -> Result<CaLocation> {
        if let Some(explicit) = self.discovery.explicit_ca() {
            debug!(ca = %explicit.url, "Using explicit CA override, skipping discovery");
            return Ok(CaLocation::Explicit(explicit));
        }
        self.resolver.resolve().await.map(CaLocation::Container)
    }

    /// Readiness and fingerprint for a located CA.
    pub async fn endpoint_for(&self, location: &CaLocation, budget: Duration) -> Result<CaEndpoint> {
        let resolved = match location {
            CaLocation::Explicit(explicit) => {
                return Ok(CaEndpoint::from_override(&explicit.url, explicit.fingerprint.clone()))
            }
            CaLocation::Container(resolved) => resolved,
        };

        let base_url = base_url_for(&resolved.name);
        self.readiness.wait_until_ready(&base_url, budget).await?;

        let fingerprint = self
            .credentials
            .get_fingerprint(Some(&resolved.container_id), &base_url)
            .await?;

        if let Some(pinned) = &self.discovery.fingerprint {
            if *pinned != fingerprint {
                return Err(TrustError::AcquisitionFailed(format!(
                    "CA {} presents fingerprint {}, configured {}",
                    resolved.name, fingerprint, pinned
                )));
            }
        }

        info!(ca = %resolved.name, tier = %resolved.tier, fingerprint = %fingerprint, "CA endpoint resolved");
        Ok(CaEndpoint::discovered(&resolved.container_id, &resolved.name, fingerprint))
    }
}

/// The set of targets a daemon converges
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// All current targets; `ca_container` is never one of them.
    async fn targets(&self, ca_container: Option<&str>) -> Result<Vec<TrustTarget>>;

    /// The target behind a started container, if it is one.
    async fn target_for_container(&self, container_id: &str) -> Result<Option<TrustTarget>>;
}

/// Running containers whose env sets the opt-in flag to a truthy value
pub struct OptedInContainers {
    runtime: Arc<dyn ContainerRuntime>,
    flag: String,
}

impl OptedInContainers {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, flag: &str) -> Self {
        Self {
            runtime,
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl TargetSource for OptedInContainers {
    async fn targets(&self, ca_container: Option<&str>) -> Result<Vec<TrustTarget>> {
        let mut targets = Vec::new();
        for summary in self.runtime.list_containers(&ContainerFilter::running()).await? {
            if Some(summary.id.as_str()) == ca_container {
                continue;
            }
            if let Some(target) = self.target_for_container(&summary.id).await? {
                targets.push(target);
            }
        }
        Ok(targets)
    }

    async fn target_for_container(&self, container_id: &str) -> Result<Option<TrustTarget>> {
        let Some(detail) = self.runtime.inspect(container_id).await? else {
            return Ok(None);
        };
        let opted_in = detail.running && detail.env_value(&self.flag).map(is_truthy).unwrap_or(false);
        Ok(opted_in.then(|| TrustTarget::container(&detail.id, &detail.name)))
    }
}

/// Source of the operator's active runtime context
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn current(&self) -> Result<String>;
}

/// The operator's machine under the active context
pub struct HostTarget {
    user: String,
    contexts: Arc<dyn ContextSource>,
}

impl HostTarget {
    pub fn new(user: &str, contexts: Arc<dyn ContextSource>) -> Self {
        Self {
            user: user.to_string(),
            contexts,
        }
    }
}

#[async_trait]
impl TargetSource for HostTarget {
    async fn targets(&self, _ca_container: Option<&str>) -> Result<Vec<TrustTarget>> {
        let context = self.contexts.current().await?;
        Ok(vec![TrustTarget::host(&self.user, &context)])
    }

    async fn target_for_container(&self, _container_id: &str) -> Result<Option<TrustTarget>> {
        Ok(None)
    }
}

/// Drives passes and feeds the convergence queue
pub struct Reconciler {
    ca: CaReconciler,
    targets: Arc<dyn TargetSource>,
    queue: ConvergenceQueue,
    board: Arc<StatusBoard>,
}

impl Reconciler {
    pub fn new(
        ca: CaReconciler,
        targets: Arc<dyn TargetSource>,
        queue: ConvergenceQueue,
        board: Arc<StatusBoard>,
    ) -> Self {
        Self {
            ca,
            targets,
            queue,
            board,
        }
    }

    pub fn background_budget(&self) -> Duration {
        self.ca.discovery().reconcile_timeout
    }

    pub fn bootstrap_budget(&self) -> Duration {
        self.ca.discovery().bootstrap_timeout
    }

    /// Resolve the CA and queue every current target. Returns how many were queued.
    pub async fn run_pass(&self, trigger: TriggerSource, budget: Duration) -> Result<usize> {
        let result = self.pass(trigger, budget).await;
        let report = match &result {
            Ok((ca, queued)) => PassReport {
                trigger,
                ca: Some(ca.clone()),
                queued: *queued,
                error: None,
                at: Utc::now(),
            },
            Err(e) => PassReport {
                trigger,
                ca: None,
                queued: 0,
                error: Some(e.to_string()),
                at: Utc::now(),
            },
        };
        self.board.record_pass(report).await;
        result.map(|(_, queued)| queued)
    }

    async fn pass(&self, trigger: TriggerSource, budget: Duration) -> Result<(String, usize)> {
        let location = self.ca.locate().await?;
        let ca = Arc::new(self.ca.endpoint_for(&location, budget).await?);
        let targets = self.targets.targets(location.container_id()).await?;

        let live: HashSet<&str> = targets.iter().map(|t| t.identity_key.as_str()).collect();
        let forgotten = self.board.retain_targets(&live).await;
        if forgotten > 0 {
            debug!(forgotten, "Dropped status of targets no longer present");
        }

        info!(trigger = %trigger, ca = %ca, targets = targets.len(), "Reconciliation pass");
        let queued = self.enqueue(targets, &ca, trigger).await?;
        Ok((ca.display_name.clone(), queued))
    }

    async fn enqueue(&self, targets: Vec<TrustTarget>, ca: &Arc<CaEndpoint>, trigger: TriggerSource) -> Result<usize> {
        let count = targets.len();
        for target in targets {
            self.queue
                .submit(WorkItem {
                    target,
                    ca: ca.clone(),
                    trigger,
                })
                .await?;
        }
        Ok(count)
    }

    /// A container started: a CA restart converges everything, an opted-in
    /// target converges alone, anything else is ignored.
    pub async fn handle_start(&self, event: &ContainerEvent) -> Result<usize> {
        let location = self.ca.locate().await?;

        if location.container_id() == Some(event.container_id.as_str()) {
            info!(ca = %event.name, "CA container started, reconverging all targets");
            return self.run_pass(TriggerSource::Event, self.background_budget()).await;
        }

        let Some(target) = self.targets.target_for_container(&event.container_id).await? else {
            debug!(container = %event.name, "Started container is not opted in");
            return Ok(0);
        };

        let ca = Arc::new(self.ca.endpoint_for(&location, self.background_budget()).await?);
        info!(target = %target, ca = %ca, "Opted-in target started");
        self.enqueue(vec![target], &ca, TriggerSource::Event).await
    }

    /// `run_pass` for watchers: failures are logged and absorbed.
    pub async fn run_background_pass(&self, trigger: TriggerSource) {
        if let Err(e) = self.run_pass(trigger, self.background_budget()).await {
            log_pass_failure(trigger, &e);
        }
    }
}

/// Pass failures never stop a watcher; they are logged at a level matching how expected they are.
pub fn log_pass_failure(trigger: TriggerSource, error: &TrustError) {
    match error {
        TrustError::NotFound => info!(trigger = %trigger, "CA not deployed yet, skipping pass"),
        TrustError::Timeout { .. } => warn!(trigger = %trigger, error = %error, "CA not ready, retrying next trigger"),
        _ if !error.is_transient() => error!(trigger = %trigger, error = %error, "Reconciliation pass cannot succeed without a configuration change"),
        _ => warn!(trigger = %trigger, error = %error, kind = error.kind(), "Reconciliation pass failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::trust::applicator::ContainerApplicator;
    use crate::agents::trust::credentials::fingerprint_of_pem;
    use crate::agents::trust::queue::WorkerPool;
    use crate::agents::trust::retry::RetryPolicy;
    use crate::agents::trust::status::ConvergenceReport;
    use crate::agents::trust::testing::{sample_pem, FakeCaApi, FakeContainer, FakeRuntime};
    use crate::agents::trust::types::{Converged, Fingerprint};

    fn discovery() -> DiscoveryConfig {
        DiscoveryConfig {
            readiness_interval: Duration::from_millis(1),
            bootstrap_timeout: Duration::from_millis(5),
            reconcile_timeout: Duration::from_millis(5),
            ..DiscoveryConfig::default()
        }
    }

    fn ca_container() -> FakeContainer {
        FakeContainer::new("ca", "step-ca")
            .label("com.smallstep.step-ca", "true")
            .respond("step certificate fingerprint", 1, "")
    }

    struct Harness {
        runtime: Arc<FakeRuntime>,
        api: Arc<FakeCaApi>,
        reconciler: Reconciler,
        queue: ConvergenceQueue,
        pool: WorkerPool,
        board: Arc<StatusBoard>,
    }

    fn harness(runtime: FakeRuntime, discovery: DiscoveryConfig) -> Harness {
        let runtime = Arc::new(runtime);
        let api = Arc::new(FakeCaApi::new());
        let credentials = Arc::new(CredentialAcquirer::new(runtime.clone(), api.clone()));
        let applicator = Arc::new(ContainerApplicator::new(
            runtime.clone(),
            credentials.clone(),
            RetryPolicy {
                interval: Duration::from_millis(1),
                max_attempts: 2,
            },
        ));
        let board = Arc::new(StatusBoard::new());
        let (queue, pool) = ConvergenceQueue::start(applicator, board.clone(), 2, 16);
        let reconciler = Reconciler::new(
            CaReconciler::new(runtime.clone(), api.clone(), credentials, discovery),
            Arc::new(OptedInContainers::new(runtime.clone(), "STEP_CA_TRUST")),
            queue.clone(),
            board.clone(),
        );
        Harness {
            runtime,
            api,
            reconciler,
            queue,
            pool,
            board,
        }
    }

    #[tokio::test]
    async fn test_pass_converges_opted_in_targets_only() {
        let h = harness(
            FakeRuntime::new()
                .with(ca_container().opted_in())
                .with(FakeContainer::ubuntu("web", "web").opted_in())
                .with(FakeContainer::ubuntu("db", "db").env("STEP_CA_TRUST", "no"))
                .with(FakeContainer::ubuntu("idle", "idle").opted_in().stopped()),
            discovery(),
        );

        let queued = h
            .reconciler
            .run_pass(TriggerSource::Bootstrap, Duration::from_millis(5))
            .await
            .unwrap();
        h.queue.close();
        h.pool.join().await;

        assert_eq!(queued, 1);
        assert_eq!(h.runtime.copy_count("web"), 1);
        assert_eq!(h.runtime.copy_count("db"), 0);
        assert_eq!(h.runtime.copy_count("ca"), 0);
        assert_eq!(h.board.snapshot().await.counters.passes, 1);
    }

    #[tokio::test]
    async fn test_pass_forgets_removed_targets() {
        let h = harness(
            FakeRuntime::new()
                .with(ca_container())
                .with(FakeContainer::ubuntu("web", "web").opted_in()),
            discovery(),
        );
        let gone = TrustTarget::container("api", "api");
        h.board
            .record_target(
                "api",
                ConvergenceReport::new(&gone, TriggerSource::Sweep, "ca", &Ok(Converged::Verified)),
            )
            .await;

        h.reconciler
            .run_pass(TriggerSource::Sweep, Duration::from_millis(5))
            .await
            .unwrap();
        h.queue.close();
        h.pool.join().await;

        assert!(h.board.target("api").await.is_none());
        assert!(h.board.target("web").await.is_some());
    }

    #[tokio::test]
    async fn test_missing_ca_skips_pass() {
        let h = harness(
            FakeRuntime::new().with(FakeContainer::ubuntu("web", "web").opted_in()),
            discovery(),
        );
        let err = h
            .reconciler
            .run_pass(TriggerSource::Sweep, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::NotFound));
        assert_eq!(h.board.snapshot().await.counters.skipped_passes, 1);
        assert_eq!(h.runtime.copy_count("web"), 0);
    }

    #[tokio::test]
    async fn test_unready_ca_times_out_without_converging() {
        let h = harness(
            FakeRuntime::new()
                .with(ca_container())
                .with(FakeContainer::ubuntu("web", "web").opted_in()),
            discovery(),
        );
        h.api.set_default_health(false);

        let err = h
            .reconciler
            .run_pass(TriggerSource::Sweep, Duration::from_millis(3))
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::Timeout { attempts: 3, .. }));
        assert_eq!(h.api.roots_calls(), 0);
        assert_eq!(h.runtime.copy_count("web"), 0);
    }

    #[tokio::test]
    async fn test_explicit_override_skips_discovery_and_readiness() {
        let mut discovery = discovery();
        discovery.ca_url = Some("https://ca.example:9000".into());
        discovery.fingerprint = Some(fingerprint_of_pem(&sample_pem(1)).unwrap());
        let h = harness(
            FakeRuntime::new().with(FakeContainer::ubuntu("web", "web").opted_in()),
            discovery,
        );

        let queued = h
            .reconciler
            .run_pass(TriggerSource::Bootstrap, Duration::from_millis(5))
            .await
            .unwrap();
        h.queue.close();
        h.pool.join().await;

        assert_eq!(queued, 1);
        assert_eq!(h.api.health_calls(), 0);
        assert_eq!(h.api.directory_calls(), 0);
        assert_eq!(h.runtime.copy_count("web"), 1);
    }

    #[tokio::test]
    async fn test_configured_fingerprint_must_match() {
        let mut discovery = discovery();
        discovery.fingerprint = Some(Fingerprint::parse(&"00".repeat(32)).unwrap());
        let h = harness(FakeRuntime::new().with(ca_container()), discovery);

        let err = h
            .reconciler
            .run_pass(TriggerSource::Sweep, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::AcquisitionFailed(_)));
    }

    #[tokio::test]
    async fn test_started_target_converges_alone() {
        let h = harness(
            FakeRuntime::new()
                .with(ca_container())
                .with(FakeContainer::ubuntu("web", "web").opted_in())
                .with(FakeContainer::ubuntu("api", "api").opted_in()),
            discovery(),
        );

        let event = ContainerEvent {
            container_id: "web".into(),
            name: "web".into(),
            action: "start".into(),
        };
        assert_eq!(h.reconciler.handle_start(&event).await.unwrap(), 1);
        h.queue.close();
        h.pool.join().await;

        assert_eq!(h.runtime.copy_count("web"), 1);
        assert_eq!(h.runtime.copy_count("api"), 0);
    }

    #[tokio::test]
    async fn test_ca_restart_converges_everything() {
        let h = harness(
            FakeRuntime::new()
                .with(ca_container())
                .with(FakeContainer::ubuntu("web", "web").opted_in())
                .with(FakeContainer::ubuntu("api", "api").opted_in()),
            discovery(),
        );

        let event = ContainerEvent {
            container_id: "ca".into(),
            name: "step-ca".into(),
            action: "start".into(),
        };
        assert_eq!(h.reconciler.handle_start(&event).await.unwrap(), 2);
        h.queue.close();
        h.pool.join().await;

        assert_eq!(h.runtime.copy_count("web"), 1);
        assert_eq!(h.runtime.copy_count("api"), 1);
    }

    #[tokio::test]
    async fn test_unrelated_start_is_ignored() {
        let h = harness(
            FakeRuntime::new()
                .with(ca_container())
                .with(FakeContainer::ubuntu("other", "other")),
            discovery(),
        );
        let event = ContainerEvent {
            container_id: "other".into(),
            name: "other".into(),
            action: "start".into(),
        };
        assert_eq!(h.reconciler.handle_start(&event).await.unwrap(), 0);
        assert_eq!(h.api.health_calls(), 0);
    }
}
