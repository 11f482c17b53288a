//! step-ca Trust Reconciliation Agent
//!
//! Discovers the step-ca container, waits until it serves ACME, acquires its
//! root fingerprint and certificates, and keeps the trust stores of opted-in
//! containers (and of the operator's host) in line with it.
//!
//! ## Architecture
//!
//! - **Runtime Query Client**: `ContainerRuntime`, Docker CLI backed
//! - **CA Resolver**: labels, declared name, then name heuristics
//! - **Readiness Gate**: `/health` and the ACME directory in one attempt
//! - **Credential Acquirer**: in-container `step` first, `/roots` fallback
//! - **Trust Applicator**: per-OS trust-store convergence, container and host
//! - **Triggers**: event stream, periodic sweep, context watcher, all feeding
//!   one bounded convergence queue

pub mod applicator;
pub mod ca_api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod host;
pub mod os_profile;
pub mod queue;
pub mod readiness;
pub mod reconciler;
pub mod resolver;
pub mod retry;
pub mod runtime;
pub mod staging;
pub mod status;
pub mod triggers;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use applicator::{ContainerApplicator, TrustApplicator};
pub use ca_api::{CaApi, HttpCaApi};
pub use config::{DiscoveryConfig, EngineConfig, HostTrustConfig};
pub use credentials::CredentialAcquirer;
pub use error::{Result, TrustError};
pub use host::{HostApplicator, LocalHost};
pub use queue::{ConvergenceQueue, WorkItem, WorkerPool};
pub use reconciler::{CaReconciler, HostTarget, OptedInContainers, Reconciler};
pub use runtime::{ContainerRuntime, DockerCli};
pub use status::StatusBoard;
pub use types::{CaEndpoint, Converged, TriggerSource, TrustTarget};
