//! Reconciliation triggers
//!
//! Three long-lived watchers feed the reconciler: the runtime event stream,
//! a periodic sweep and, for the host variant, the active-context watcher.
//! All of them stop when the shutdown channel flips to `true`.

use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::error::{Result, TrustError};
use super::reconciler::ContextSource;
use super::runtime::ContainerRuntime;
use super::types::{ContainerEvent, EventFilter};

/// Resolves once shutdown has been requested (or the sender is gone).
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep unless shutdown comes first; `false` means stop.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = stopped(shutdown) => false,
        _ = sleep(delay) => true,
    }
}

/// Subscribe to start events and hand each to `on_event` on its own task.
///
/// At most `max_in_flight` handlers run at once; later events wait for a
/// permit. The subscription is re-established after `reconnect_delay`
/// whenever the stream ends or the runtime is unreachable. Handlers still
/// running at shutdown are aborted before this returns.
pub async fn run_event_listener<F, Fut>(
    runtime: Arc<dyn ContainerRuntime>,
    mut shutdown: watch::Receiver<bool>,
    reconnect_delay: Duration,
    max_in_flight: usize,
    on_event: F,
) where
    F: Fn(ContainerEvent) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let filter = EventFilter::starts();
    let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut handlers = JoinSet::new();
    info!(max_in_flight = max_in_flight.max(1), "Event listener started");

    'subscribe: loop {
        if *shutdown.borrow() {
            break;
        }

        let mut events = match runtime.stream_events(&filter).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Cannot subscribe to runtime events, retrying");
                if !pause(&mut shutdown, reconnect_delay).await {
                    break;
                }
                continue;
            }
        };
        debug!("Subscribed to runtime events");

        loop {
            let next = tokio::select! {
                _ = stopped(&mut shutdown) => break 'subscribe,
                Some(_) = handlers.join_next(), if !handlers.is_empty() => continue,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) if filter.actions.contains(&event.action) => {
                    debug!(container = %event.name, action = %event.action, "Runtime event");
                    let permits = permits.clone();
                    let handler = on_event(event);
                    handlers.spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        handler.await;
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(TrustError::RuntimeUnavailable(reason))) => {
                    warn!(error = %reason, "Event stream lost the runtime, reconnecting");
                    break;
                }
                Some(Err(e)) => warn!(error = %e, "Skipping unreadable runtime event"),
                None => {
                    warn!("Event stream ended, reconnecting");
                    break;
                }
            }
        }

        if !pause(&mut shutdown, reconnect_delay).await {
            break;
        }
    }

    if !handlers.is_empty() {
        debug!(in_flight = handlers.len(), "Aborting in-flight event handlers");
    }
    handlers.shutdown().await;
    info!("Event listener stopped");
}

/// Run `pass` every `period`, starting one period from now.
pub async fn run_periodic_sweep<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    info!(interval_secs = period.as_secs(), "Periodic sweep started");

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        debug!("Periodic sweep firing");
        pass().await;
    }

    info!("Periodic sweep stopped");
}

/// Active Docker context as reported by the CLI
pub struct DockerContextSource {
    binary: String,
    call_timeout: Duration,
}

impl DockerContextSource {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl ContextSource for DockerContextSource {
    async fn current(&self) -> Result<String> {
        let output = timeout(
            self.call_timeout,
            Command::new(&self.binary)
                .args(["context", "show"])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| TrustError::Command(format!("{} context show timed out", self.binary)))?
        .map_err(|e| TrustError::RuntimeUnavailable(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(TrustError::Command(format!(
                "{} context show: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let context = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if context.is_empty() {
            Ok("default".to_string())
        } else {
            Ok(context)
        }
    }
}

/// Watches the active runtime context for changes.
///
/// When a CLI config directory is given, filesystem notifications for its
/// `config.json` trigger an immediate re-read. The context is re-read every
/// `poll_interval` regardless, which is all that happens when no directory
/// is given or the notification watcher cannot be set up.
pub struct ContextWatcher {
    source: Arc<dyn ContextSource>,
    poll_interval: Duration,
    config_dir: Option<PathBuf>,
}

impl ContextWatcher {
    pub fn new(source: Arc<dyn ContextSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
            config_dir: None,
        }
    }

    pub fn watching(mut self, config_dir: PathBuf) -> Self {
        self.config_dir = Some(config_dir);
        self
    }

    /// Call `on_change` with each new context, starting from `initial`.
    pub async fn run<F, Fut>(self, initial: Option<String>, mut shutdown: watch::Receiver<bool>, mut on_change: F)
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        // The watcher stops delivering once dropped, so it lives as long as the loop.
        let (_watcher, mut changes) = match self.config_dir.as_deref().and_then(watch_config_dir) {
            Some((watcher, rx)) => (Some(watcher), Some(rx)),
            None => (None, None),
        };

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut current = initial;
        info!(context = ?current, notified = changes.is_some(), "Context watcher started");

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {}
                _ = config_changed(&mut changes) => debug!("Runtime config changed"),
            }

            match self.source.current().await {
                Ok(context) if current.as_deref() != Some(context.as_str()) => {
                    info!(from = ?current, to = %context, "Active context changed");
                    current = Some(context.clone());
                    on_change(context).await;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Could not read the active context"),
            }
        }

        info!("Context watcher stopped");
    }
}

const CONFIG_FILE_NAME: &str = "config.json";

/// Notifications for writes to `config.json` inside `dir`, coalesced into one
/// pending signal. `None` when the platform watcher cannot be set up.
fn watch_config_dir(dir: &Path) -> Option<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);

    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else {
            return;
        };
        let relevant = matches!(
            event.kind,
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
        ) && (event.paths.is_empty()
            || event
                .paths
                .iter()
                .any(|p| p.file_name().is_some_and(|name| name == CONFIG_FILE_NAME)));
        if relevant {
            let _ = tx.try_send(());
        }
    });

    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(error = %e, "Cannot create a config watcher, polling only");
            return None;
        }
    };

    // The directory is watched because the CLI replaces config.json by rename.
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!(dir = %dir.display(), error = %e, "Cannot watch the runtime config directory, polling only");
        return None;
    }
    debug!(dir = %dir.display(), "Watching runtime config");
    Some((watcher, rx))
}

/// Resolves on the next config notification; never, without a watcher.
async fn config_changed(changes: &mut Option<mpsc::Receiver<()>>) {
    let open = match changes.as_mut() {
        Some(rx) => rx.recv().await.is_some(),
        None => std::future::pending().await,
    };
    if !open {
        warn!("Config watcher went away, polling only");
        *changes = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::trust::testing::FakeRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn start(id: &str) -> ContainerEvent {
        ContainerEvent {
            container_id: id.to_string(),
            name: id.to_string(),
            action: "start".to_string(),
        }
    }

    #[tokio::test]
    async fn test_event_listener_reconnects_and_stops() {
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_events(vec![start("a")])
                .with_events(vec![
                    start("b"),
                    ContainerEvent {
                        action: "die".to_string(),
                        ..start("c")
                    },
                ]),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let listener = tokio::spawn(run_event_listener(
            runtime.clone(),
            shutdown_rx,
            Duration::from_millis(1),
            4,
            move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.container_id);
                }
            },
        ));

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("a", "b"));

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), listener).await.unwrap().unwrap();
        assert!(runtime.subscriptions() >= 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_listener_survives_unavailable_runtime() {
        let runtime = Arc::new(FakeRuntime::new().unavailable());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = tokio::spawn(run_event_listener(
            runtime.clone(),
            shutdown_rx,
            Duration::from_millis(1),
            1,
            |_| async {},
        ));
        sleep(Duration::from_millis(10)).await;
        assert!(!listener.is_finished());

        runtime.set_unavailable(false);
        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), listener).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_event_handlers_are_bounded() {
        let ids = ["a", "b", "c", "d", "e", "f"];
        let runtime = Arc::new(FakeRuntime::new().with_events(ids.iter().map(|id| start(id)).collect()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (counter, high) = (running.clone(), peak.clone());
        let listener = tokio::spawn(run_event_listener(
            runtime,
            shutdown_rx,
            Duration::from_secs(3600),
            2,
            move |event| {
                let (tx, counter, high) = (tx.clone(), counter.clone(), high.clone());
                async move {
                    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    high.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(event.container_id);
                }
            },
        ));

        let mut handled = Vec::new();
        for _ in ids {
            handled.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
        }
        handled.sort();
        assert_eq!(handled, ids);
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), listener).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_in_flight_handlers() {
        let runtime = Arc::new(FakeRuntime::new().with_events(vec![start("slow")]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        let listener = tokio::spawn(run_event_listener(
            runtime,
            shutdown_rx,
            Duration::from_secs(3600),
            1,
            move |_| {
                let (tx, done) = (tx.clone(), done.clone());
                async move {
                    let _ = tx.send(());
                    sleep(Duration::from_secs(3600)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), listener).await.unwrap().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_periodic_sweep_fires_until_shutdown() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let counter = fired.clone();
        let sweep = tokio::spawn(run_periodic_sweep(Duration::from_millis(2), shutdown_rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), sweep).await.unwrap().unwrap();

        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 2, "sweep fired {count} times");
    }

    struct FakeContexts(Mutex<String>);

    #[async_trait]
    impl ContextSource for FakeContexts {
        async fn current(&self) -> Result<String> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_context_watcher_reports_each_switch_once() {
        let contexts = Arc::new(FakeContexts(Mutex::new("prod".to_string())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher = ContextWatcher::new(contexts.clone(), Duration::from_millis(2));
        let handle = tokio::spawn(watcher.run(Some("prod".to_string()), shutdown_rx, move |context| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(context);
            }
        }));

        *contexts.0.lock().unwrap() = "staging".to_string();
        let changed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(changed, "staging");

        *contexts.0.lock().unwrap() = "prod".to_string();
        let changed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(changed, "prod");

        sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_config_file_change_triggers_early_read() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, r#"{"currentContext":"prod"}"#).unwrap();

        let contexts = Arc::new(FakeContexts(Mutex::new("prod".to_string())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher = ContextWatcher::new(contexts.clone(), Duration::from_secs(3600)).watching(dir.path().to_path_buf());
        let handle = tokio::spawn(watcher.run(Some("prod".to_string()), shutdown_rx, move |context| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(context);
            }
        }));

        sleep(Duration::from_millis(100)).await;
        *contexts.0.lock().unwrap() = "remote".to_string();
        std::fs::write(&config, r#"{"currentContext":"remote"}"#).unwrap();

        let changed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(changed, "remote");

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unwatchable_config_dir_falls_back_to_polling() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir");

        let contexts = Arc::new(FakeContexts(Mutex::new("prod".to_string())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher = ContextWatcher::new(contexts.clone(), Duration::from_millis(2)).watching(missing);
        let handle = tokio::spawn(watcher.run(Some("prod".to_string()), shutdown_rx, move |context| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(context);
            }
        }));

        *contexts.0.lock().unwrap() = "staging".to_string();
        let changed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(changed, "staging");

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
