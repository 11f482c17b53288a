//! Host Trust Agent - Standalone Binary
//!
//! Installs the step-ca intermediate into the operator machine's trust store,
//! once per user and Docker context, and re-converges whenever the active
//! context changes or the CA restarts.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stepca_trust_engine::agents::trust::{
    os_profile::validate_profiles,
    reconciler::{log_pass_failure, ContextSource},
    triggers::{run_event_listener, run_periodic_sweep, ContextWatcher, DockerContextSource},
    CaApi, CaReconciler, ContainerRuntime, ConvergenceQueue, CredentialAcquirer, DiscoveryConfig,
    DockerCli, HostApplicator, HostTarget, HostTrustConfig, HttpCaApi, LocalHost, Reconciler,
    StatusBoard, TriggerSource,
};

const CA_API_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Start events handled at once; each waits for the CA before touching the host.
const EVENT_HANDLERS: usize = 2;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SudoMode {
    /// Only when not running as root
    Auto,
    Always,
    Never,
}

/// Host Trust Agent - trusts the step-ca intermediate on this machine
#[derive(Parser, Debug)]
#[command(name = "host-trust-agent", version, about)]
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

    /// Periodic re-convergence interval in seconds
    #[arg(long, default_value = "300", env = "STEP_CA_SWEEP_INTERVAL")]
    sweep_interval: u64,

    /// Seconds between re-reads of the active Docker context
    #[arg(long, default_value = "10", env = "STEP_CA_CONTEXT_POLL_INTERVAL")]
    context_poll_interval: u64,

    /// Filename prefix of host trust records
    #[arg(long, default_value = "stepca", env = "STEP_CA_TRUST_PREFIX")]
    prefix: String,

    /// User the trust record is named after
    #[arg(long, env = "USER")]
    user: String,

    /// Prefix host mutations with `sudo -n`
    #[arg(long, value_enum, default_value = "auto", env = "STEP_CA_HOST_SUDO")]
    sudo: SudoMode,

    /// Docker CLI config directory, watched for context switches
    #[arg(long, env = "DOCKER_CONFIG")]
    docker_config: Option<PathBuf>,

    /// Container runtime CLI
    #[arg(long, default_value = "docker", env = "DOCKER_BIN")]
    docker_bin: String,

    /// Converge once for the current context and exit
    #[arg(long, default_value = "false")]
    once: bool,

    /// Dry run - detect and fetch, but don't touch the trust store
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[arg(long, value_enum, default_value = "json", env = "LOG_FORMAT")]
    log_format: LogFormat,
}

impl Args {
    async fn host_config(&self) -> Result<HostTrustConfig> {
        let discovery = DiscoveryConfig {
            container_name: self.container_name.clone(),
            ca_url: self.ca_url.clone(),
            bootstrap_timeout: Duration::from_secs(self.bootstrap_timeout),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout),
            ..DiscoveryConfig::default()
        }
        .with_raw_fingerprint(self.fingerprint.as_deref())?;

        let use_sudo = match self.sudo {
            SudoMode::Always => true,
            SudoMode::Never => false,
            SudoMode::Auto => !running_as_root().await,
        };

        let config = HostTrustConfig {
            discovery,
            prefix: self.prefix.clone(),
            use_sudo,
            poll_interval: Duration::from_secs(self.context_poll_interval),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            dry_run: self.dry_run,
            ..HostTrustConfig::new(&self.user)
        };
        config.validate()?;
        Ok(config)
    }

    /// `DOCKER_CONFIG`, else `~/.docker`.
    fn docker_config_dir(&self) -> Option<PathBuf> {
        self.docker_config
            .clone()
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker")))
    }
}

async fn running_as_root() -> bool {
    match Command::new("id").arg("-u").output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "0",
        Err(e) => {
            warn!(error = %e, "Cannot determine the effective user, assuming non-root");
            false
        }
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

    let config = args.host_config().await.context("Invalid configuration")?;
    validate_profiles().context("Trust-store profile table is incomplete")?;

    info!(
        user = %config.user,
        prefix = %config.prefix,
        sudo = config.use_sudo,
        dry_run = config.dry_run,
        "Starting host trust agent"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(&args.docker_bin));
    let api: Arc<dyn CaApi> = Arc::new(HttpCaApi::new(CA_API_TIMEOUT).context("Failed to create CA client")?);
    let credentials = Arc::new(CredentialAcquirer::new(runtime.clone(), api.clone()));
    let contexts: Arc<dyn ContextSource> = Arc::new(DockerContextSource::new(&args.docker_bin));

    let applicator = Arc::new(
        HostApplicator::new(Arc::new(LocalHost), credentials.clone(), api.clone(), &config.prefix)
            .use_sudo(config.use_sudo)
            .dry_run(config.dry_run),
    );
    let board = Arc::new(StatusBoard::new());
    let (queue, pool) = ConvergenceQueue::start(applicator, board.clone(), 1, 16);

    let reconciler = Arc::new(Reconciler::new(
        CaReconciler::new(runtime.clone(), api, credentials, config.discovery.clone()),
        Arc::new(HostTarget::new(&config.user, contexts.clone())),
        queue.clone(),
        board.clone(),
    ));

    if args.once {
        reconciler
            .run_pass(TriggerSource::Bootstrap, reconciler.bootstrap_budget())
            .await
            .context("Host trust pass failed")?;
        queue.close();
        pool.join().await;

        if board.failed_count() > 0 {
            bail!("Host trust convergence failed");
        }
        info!("Host trust converged");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let initial_context = match contexts.current().await {
        Ok(context) => Some(context),
        Err(e) => {
            warn!(error = %e, "Cannot read the active context yet");
            None
        }
    };

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

    let mut watcher = ContextWatcher::new(contexts, config.poll_interval);
    if let Some(dir) = args.docker_config_dir() {
        watcher = watcher.watching(dir);
    }
    let context_changes = {
        let reconciler = reconciler.clone();
        tokio::spawn(watcher.run(initial_context, shutdown_rx.clone(), move |_| {
            let reconciler = reconciler.clone();
            async move { reconciler.run_background_pass(TriggerSource::ContextChange).await }
        }))
    };

    let events = {
        let reconciler = reconciler.clone();
        tokio::spawn(run_event_listener(
            runtime.clone(),
            shutdown_rx.clone(),
            EVENT_RECONNECT_DELAY,
            EVENT_HANDLERS,
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
        tokio::spawn(run_periodic_sweep(
            config.sweep_interval,
            shutdown_rx.clone(),
            move || {
                let reconciler = reconciler.clone();
                async move { reconciler.run_background_pass(TriggerSource::Sweep).await }
            },
        ))
    };

    shutdown_signal().await;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    bootstrap.abort();
    let _ = context_changes.await;
    let _ = events.await;
    let _ = sweep.await;

    queue.close();
    pool.join().await;
    info!("Host trust agent stopped");
    Ok(())
}
