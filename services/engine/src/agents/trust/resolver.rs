//! CA Resolver
//!
//! Finds the one running container that is the step-ca instance:
//! labels first, then an explicitly declared name, then name heuristics.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{Result, TrustError};
use super::runtime::ContainerRuntime;
use super::types::{ContainerDetail, ContainerFilter, ContainerSummary, CA_PORT};

/// Name suffix every heuristic candidate must carry.
pub const CA_NAME_SUFFIX: &str = "step-ca";

/// Env prefix the step-ca image uses for its init settings.
pub const CA_ENV_PREFIX: &str = "DOCKER_STEPCA_";

/// A label that marks a container as the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelRule {
    pub key: &'static str,
    /// `None` matches on key presence alone.
    pub value: Option<&'static str>,
}

/// Label rules in preference order: canonical, generic, legacy companion.
pub const CA_LABELS: [LabelRule; 3] = [
    LabelRule {
        key: "com.smallstep.step-ca",
        value: Some("true"),
    },
    LabelRule {
        key: "ca.role",
        value: Some("step-ca"),
    },
    LabelRule {
        key: "stepca-companion.ca",
        value: None,
    },
];

/// A heuristic method, evaluated over containers whose name ends in `step-ca`
pub struct HeuristicRule {
    pub name: &'static str,
    pub matches: fn(&ContainerDetail) -> bool,
}

/// Heuristics in evaluation order; the first rule with any match wins.
pub const HEURISTICS: [HeuristicRule; 3] = [
    HeuristicRule {
        name: "suffix+env",
        matches: has_ca_env,
    },
    HeuristicRule {
        name: "suffix+port",
        matches: publishes_ca_port,
    },
    HeuristicRule {
        name: "suffix",
        matches: uncorroborated,
    },
];

fn has_ca_env(detail: &ContainerDetail) -> bool {
    detail.has_env_prefix(CA_ENV_PREFIX)
}

fn publishes_ca_port(detail: &ContainerDetail) -> bool {
    detail.publishes_port(CA_PORT)
}

fn uncorroborated(_: &ContainerDetail) -> bool {
    true
}

/// Which tier produced the resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionTier {
    Label(&'static str),
    DeclaredName,
    Heuristic(&'static str),
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionTier::Label(key) => write!(f, "label:{}", key),
            ResolutionTier::DeclaredName => write!(f, "declared_name"),
            ResolutionTier::Heuristic(rule) => write!(f, "heuristic:{}", rule),
        }
    }
}

/// The container believed to be the CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCa {
    pub container_id: String,
    pub name: String,
    pub tier: ResolutionTier,
}

/// Tiered CA discovery over the current container population
pub struct CaResolver {
    runtime: Arc<dyn ContainerRuntime>,
    declared_name: Option<String>,
}

impl CaResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, declared_name: Option<String>) -> Self {
        Self {
            runtime,
            declared_name: declared_name.filter(|n| !n.trim().is_empty()),
        }
    }

    /// Resolve the CA container, or `NotFound`.
    pub async fn resolve(&self) -> Result<ResolvedCa> {
        if let Some(found) = self.by_label().await? {
            return Ok(found);
        }

        if let Some(declared) = &self.declared_name {
            match self.by_declared_name(declared).await? {
                Some(found) => return Ok(found),
                None => warn!(
                    name = %declared,
                    "Declared CA container not found among running containers, falling back to heuristics"
                ),
            }
        }

        if let Some(found) = self.by_heuristics().await? {
            return Ok(found);
        }

        debug!("No container matched any CA discovery tier");
        Err(TrustError::NotFound)
    }

    async fn by_label(&self) -> Result<Option<ResolvedCa>> {
        for rule in &CA_LABELS {
            let filter = ContainerFilter::running().with_label(rule.key, rule.value);
            let matches = self.runtime.list_containers(&filter).await?;

            if let Some(chosen) = pick_deterministic(matches) {
                info!(
                    container = %chosen.name,
                    label = rule.key,
                    "Resolved CA by label"
                );
                return Ok(Some(ResolvedCa {
                    container_id: chosen.id,
                    name: chosen.name,
                    tier: ResolutionTier::Label(rule.key),
                }));
            }
        }
        Ok(None)
    }

    async fn by_declared_name(&self, declared: &str) -> Result<Option<ResolvedCa>> {
        let wanted = declared.trim_start_matches('/');
        let filter = ContainerFilter::running().with_name(wanted);
        let found = self
            .runtime
            .list_containers(&filter)
            .await?
            .into_iter()
            .find(|c| c.running && c.name.trim_start_matches('/') == wanted);

        Ok(found.map(|c| {
            info!(container = %c.name, "Resolved CA by declared name");
            ResolvedCa {
                container_id: c.id,
                name: c.name,
                tier: ResolutionTier::DeclaredName,
            }
        }))
    }

    async fn by_heuristics(&self) -> Result<Option<ResolvedCa>> {
        let filter = ContainerFilter::running().with_name(CA_NAME_SUFFIX);
        let mut candidates = Vec::new();
        for summary in self.runtime.list_containers(&filter).await? {
            if !summary.running || !summary.name.ends_with(CA_NAME_SUFFIX) {
                continue;
            }
            // A candidate may vanish between listing and inspection.
            if let Some(detail) = self.runtime.inspect(&summary.id).await? {
                if detail.running {
                    candidates.push(detail);
                }
            }
        }
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(evaluate_heuristics(&candidates).map(|(rule, detail)| {
            if rule == "suffix" {
                warn!(
                    container = %detail.name,
                    "Resolved CA by name suffix alone, no corroborating env or port"
                );
            } else {
                info!(container = %detail.name, rule, "Resolved CA by heuristic");
            }
            ResolvedCa {
                container_id: detail.id.clone(),
                name: detail.name.clone(),
                tier: ResolutionTier::Heuristic(rule),
            }
        }))
    }
}

/// Top-down evaluation of the heuristic table over inspected candidates.
pub fn evaluate_heuristics(candidates: &[ContainerDetail]) -> Option<(&'static str, &ContainerDetail)> {
    HEURISTICS.iter().find_map(|rule| {
        candidates
            .iter()
            .filter(|d| d.name.ends_with(CA_NAME_SUFFIX))
            .find(|d| (rule.matches)(d))
            .map(|d| (rule.name, d))
    })
}

fn pick_deterministic(mut matches: Vec<ContainerSummary>) -> Option<ContainerSummary> {
    matches.retain(|c| c.running);
    matches.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    matches.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::trust::testing::{FakeContainer, FakeRuntime};

    fn resolver(runtime: FakeRuntime, declared: Option<&str>) -> CaResolver {
        CaResolver::new(Arc::new(runtime), declared.map(str::to_string))
    }

    #[tokio::test]
    async fn test_canonical_label_beats_legacy() {
        let runtime = FakeRuntime::new()
            .with(FakeContainer::new("legacy", "old-ca").label("stepca-companion.ca", "yes"))
            .with(FakeContainer::new("canon", "new-ca").label("com.smallstep.step-ca", "true"));

        let resolved = resolver(runtime, None).resolve().await.unwrap();
        assert_eq!(resolved.container_id, "canon");
        assert_eq!(resolved.tier, ResolutionTier::Label("com.smallstep.step-ca"));
    }

    #[tokio::test]
    async fn test_same_container_with_both_labels() {
        let runtime = FakeRuntime::new().with(
            FakeContainer::new("ca", "ca")
                .label("com.smallstep.step-ca", "true")
                .label("stepca-companion.ca", "1"),
        );
        let resolved = resolver(runtime, None).resolve().await.unwrap();
        assert_eq!(resolved.tier, ResolutionTier::Label("com.smallstep.step-ca"));
    }

    #[tokio::test]
    async fn test_label_priority_is_total() {
        // Every non-empty subset of labels, each on its own container.
        for mask in 1u8..8 {
            let mut runtime = FakeRuntime::new();
            for (i, rule) in CA_LABELS.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    runtime = runtime.with(
                        FakeContainer::new(&format!("c{}", i), &format!("ca-{}", i))
                            .label(rule.key, rule.value.unwrap_or("x")),
                    );
                }
            }
            let expected = (0..3).find(|i| mask & (1 << i) != 0).unwrap();
            let resolved = resolver(runtime, None).resolve().await.unwrap();
            assert_eq!(resolved.container_id, format!("c{}", expected), "mask {mask:03b}");
        }
    }

    #[tokio::test]
    async fn test_label_value_must_match() {
        let runtime = FakeRuntime::new()
            .with(FakeContainer::new("a", "something").label("com.smallstep.step-ca", "false"));
        let err = resolver(runtime, None).resolve().await.unwrap_err();
        assert!(matches!(err, TrustError::NotFound));
    }

    #[tokio::test]
    async fn test_stopped_labelled_container_is_ignored() {
        let runtime = FakeRuntime::new()
            .with(
                FakeContainer::new("dead", "dead-ca")
                    .label("com.smallstep.step-ca", "true")
                    .stopped(),
            )
            .with(FakeContainer::new("live", "proj-step-ca"));
        let resolved = resolver(runtime, None).resolve().await.unwrap();
        assert_eq!(resolved.container_id, "live");
    }

    #[tokio::test]
    async fn test_declared_name_exact_match() {
        let runtime = FakeRuntime::new()
            .with(FakeContainer::new("x", "my-ca-backup"))
            .with(FakeContainer::new("y", "my-ca"));
        let resolved = resolver(runtime, Some("my-ca")).resolve().await.unwrap();
        assert_eq!(resolved.container_id, "y");
        assert_eq!(resolved.tier, ResolutionTier::DeclaredName);
    }

    #[tokio::test]
    async fn test_missing_declared_name_falls_through() {
        let runtime = FakeRuntime::new().with(FakeContainer::new("h", "proj-step-ca"));
        let resolved = resolver(runtime, Some("absent")).resolve().await.unwrap();
        assert_eq!(resolved.container_id, "h");
        assert_eq!(resolved.tier, ResolutionTier::Heuristic("suffix"));
    }

    #[tokio::test]
    async fn test_heuristic_order() {
        let runtime = FakeRuntime::new()
            .with(FakeContainer::new("bare", "a-step-ca"))
            .with(FakeContainer::new("port", "b-step-ca").port(9000))
            .with(FakeContainer::new("env", "c-step-ca").env("DOCKER_STEPCA_INIT_NAME", "CA"));
        let resolved = resolver(runtime, None).resolve().await.unwrap();
        assert_eq!(resolved.container_id, "env");
        assert_eq!(resolved.tier, ResolutionTier::Heuristic("suffix+env"));

        let runtime = FakeRuntime::new()
            .with(FakeContainer::new("bare", "a-step-ca"))
            .with(FakeContainer::new("port", "b-step-ca").port(9000));
        let resolved = resolver(runtime, None).resolve().await.unwrap();
        assert_eq!(resolved.container_id, "port");
    }

    #[tokio::test]
    async fn test_suffix_must_be_at_end() {
        let runtime = FakeRuntime::new()
            .with(FakeContainer::new("a", "step-ca-proxy").env("DOCKER_STEPCA_INIT_NAME", "CA"));
        assert!(matches!(
            resolver(runtime, None).resolve().await,
            Err(TrustError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_runtime_unavailable_is_surfaced() {
        let runtime = FakeRuntime::new().unavailable();
        assert!(matches!(
            resolver(runtime, None).resolve().await,
            Err(TrustError::RuntimeUnavailable(_))
        ));
    }
}
