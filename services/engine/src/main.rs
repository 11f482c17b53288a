//! step-ca Trust Engine
//!
//! Keeps every opted-in container trusting the step-ca root: one bootstrap
//! pass at startup, then the runtime event stream and a periodic sweep.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stepca_trust_engine::agents::trust::{
    os_profile::validate_profiles,
    reconciler::log_pass_failure,
    retry::RetryPolicy,
    status,
    triggers::{run_event_listener, run_periodic_sweep},
    CaApi, CaReconciler, ContainerApplicator, ContainerRuntime, ConvergenceQueue,
    CredentialAcquirer, DiscoveryConfig, DockerCli, EngineConfig, HttpCaApi, OptedInContainers,
    Reconciler, StatusBoard, TriggerSource,
};

const CA_API_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// Trust Engine - propagates step-ca trust into opted-in containers
#[derive(Parser, Debug)]
#[command(name = "trust-engine", version, about)]
struct Args {
    /// Name of the CA container (skips label discovery when found)
    #[arg(long, env = "STEP_CA_CONTAINER_NAME")]
    container_name: Option<String>,

    /// CA URL; together with --fingerprint bypasses discovery entirely
    #[arg(long, env = "STEP_CA_URL")]
    ca_url: Option<String>,

    /// Expected root fingerprint (hex SHA-256)
    #[arg(long, env = "STEP_CA_FINGERPRINT")]
    fingerprint: Option<String>,

    /// Seconds to wait for the CA on the bootstrap pass
    #[arg(long, default_value = "120", env = "STEP_CA_BOOTSTRAP_TIMEOUT")]
    bootstrap_timeout: u64,

    /// Seconds to wait for the CA on background passes
    #[arg(long, default_value = "30", env = "STEP_CA_RECONCILE_TIMEOUT")]
    reconcile_timeout: u64,

    /// Periodic sweep interval in seconds
    #[arg(long, default_value = "300", env = "STEP_CA_SWEEP_INTERVAL")]
    sweep_interval: u64,

    /// Env var a container sets to a truthy value to opt in
    #[arg(long, default_value = "STEP_CA_TRUST", env = "STEP_CA_TRUST_FLAG")]
    trust_flag: String,

    /// Concurrent convergence workers
    #[arg(long, default_value = "4", env = "STEP_CA_WORKERS")]
    workers: usize,

    /// Container runtime CLI
    #[arg(long, default_value = "docker", env = "DOCKER_BIN")]
    docker_bin: String,

    /// Serve /health and /api/trust/status on this address
    #[arg(long, env = "STEP_CA_STATUS_ADDR")]
    status_addr: Option<SocketAddr>,

    /// Run a single bootstrap pass and exit
    #[arg(long, default_value = "false")]
    once: bool,

    /// Dry run - detect and fetch, but don't touch trust stores
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[arg(long, value_enum, default_value = "json", env = "LOG_FORMAT")]
    log_format: LogFormat,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        let discovery = DiscoveryConfig {
            container_name: self.container_name.clone(),
            ca_url: self.ca_url.clone(),
            bootstrap_timeout: Duration::from_secs(self.bootstrap_timeout),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout),
            ..DiscoveryConfig::default()
        }
        .with_raw_fingerprint(self.fingerprint.as_deref())?;

        let config = EngineConfig {
            discovery,
            opt_in_flag: self.trust_flag.clone(),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            workers: self.workers,
            dry_run: self.dry_run,
            ..EngineConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_format);

    let config = args.engine_config().context("Invalid configuration")?;
    validate_profiles().context("Trust-store profile table is incomplete")?;

    info!(
        flag = %config.opt_in_flag,
        workers = config.workers,
        sweep_interval = config.sweep_interval.as_secs(),
        dry_run = config.dry_run,
        explicit_ca = config.discovery.explicit_ca().is_some(),
        "Starting step-ca trust engine"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(&args.docker_bin));
    let api: Arc<dyn CaApi> = Arc::new(HttpCaApi::new(CA_API_TIMEOUT).context("Failed to create CA client")?);
    let credentials = Arc::new(CredentialAcquirer::new(runtime.clone(), api.clone()));

    let applicator = Arc::new(
        ContainerApplicator::new(
            runtime.clone(),
            credentials.clone(),
            RetryPolicy::from_budget(config.target_ready_timeout, config.target_ready_interval),
        )
        .dry_run(config.dry_run),
    );
    let board = Arc::new(StatusBoard::new());
    let (queue, pool) = ConvergenceQueue::start(applicator, board.clone(), config.workers, config.queue_capacity);

    let reconciler = Arc::new(Reconciler::new(
        CaReconciler::new(runtime.clone(), api, credentials, config.discovery.clone()),
        Arc::new(OptedInContainers::new(runtime.clone(), &config.opt_in_flag)),
        queue.clone(),
        board.clone(),
    ));

    if args.once {
        let queued = reconciler
            .run_pass(TriggerSource::Bootstrap, reconciler.bootstrap_budget())
            .await
            .context("Bootstrap pass failed")?;
        queue.close();
        pool.join().await;

        let failed = board.failed_count();
        info!(queued, failed, "Bootstrap pass complete");
        if failed > 0 {
            bail!("{} of {} targets failed to converge", failed, queued);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = args.status_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status address {}", addr))?;
        info!("Status API listening on {}", addr);

        let app = status::router(board.clone());
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "Status API stopped");
            }
        });
    }

    let bootstrap = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler
                .run_pass(TriggerSource::Bootstrap, reconciler.bootstrap_budget())
                .await
            {
                log_pass_failure(TriggerSource::Bootstrap, &e);
            }
        })
    };

    let events = {
        let reconciler = reconciler.clone();
        tokio::spawn(run_event_listener(
            runtime.clone(),
            shutdown_rx.clone(),
            EVENT_RECONNECT_DELAY,
            config.workers,
            move |event| {
                let reconciler = reconciler.clone();
                async move {
                    if let Err(e) = reconciler.handle_start(&event).await {
                        log_pass_failure(TriggerSource::Event, &e);
                    }
                }
            },
        ))
    };

    let sweep = {
        let reconciler = reconciler.clone();
        tokio::spawn(run_periodic_sweep(config.sweep_interval, shutdown_rx.clone(), move || {
            let reconciler = reconciler.clone();
            async move { reconciler.run_background_pass(TriggerSource::Sweep).await }
        }))
    };

    shutdown_signal().await;
    info!("Shutdown requested, draining convergence queue");

    let _ = shutdown_tx.send(true);
    bootstrap.abort();
    let _ = events.await;
    let _ = sweep.await;

    queue.close();
    pool.join().await;
    info!("Trust engine stopped");
    Ok(())
}
