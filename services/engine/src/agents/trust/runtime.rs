//! Container Runtime Client
//!
//! Read/exec-only access to the container runtime. The production
//! implementation drives the Docker CLI so it follows whatever context the
//! operator has selected; errors are surfaced, never retried here.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::{Result, TrustError};
use super::types::{
    ContainerDetail, ContainerEvent, ContainerFilter, ContainerSummary, EventFilter, ExecOutput,
};

/// Uniform access to the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers matching the filter
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>>;

    /// Inspect one container; `None` when it no longer exists
    async fn inspect(&self, id: &str) -> Result<Option<ContainerDetail>>;

    /// Live lifecycle events; infinite until dropped
    async fn stream_events(
        &self,
        filter: &EventFilter,
    ) -> Result<BoxStream<'static, Result<ContainerEvent>>>;

    /// Run a command inside a container
    async fn exec(&self, id: &str, command: &[&str]) -> Result<ExecOutput>;

    /// Copy a local file to a path inside a container
    async fn copy_file_into(&self, id: &str, local_path: &Path, remote_path: &str) -> Result<()>;
}

/// Docker CLI backed runtime
pub struct DockerCli {
    binary: String,
    call_timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        debug!(binary = %self.binary, args = ?args, "Running runtime command");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        timeout(self.call_timeout, cmd.output())
            .await
            .map_err(|_| {
                TrustError::RuntimeUnavailable(format!(
                    "{} {} timed out after {:?}",
                    self.binary,
                    args.first().map(String::as_str).unwrap_or_default(),
                    self.call_timeout
                ))
            })?
            .map_err(|e| TrustError::RuntimeUnavailable(format!("failed to run {}: {}", self.binary, e)))
    }

    fn failure(&self, args: &[String], output: &Output) -> TrustError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if daemon_unreachable(&stderr) {
            TrustError::RuntimeUnavailable(stderr)
        } else {
            TrustError::Command(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr
            ))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let args = ps_args(filter);
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(self.failure(&args, &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut containers = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_ps_line(line) {
                Ok(summary) => containers.push(summary),
                Err(e) => warn!(error = %e, "Skipping unparseable container listing row"),
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerDetail>> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            id.to_string(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(None);
            }
            return Err(self.failure(&args, &output));
        }

        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    async fn stream_events(
        &self,
        filter: &EventFilter,
    ) -> Result<BoxStream<'static, Result<ContainerEvent>>> {
        let mut args = vec![
            "events".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            "--filter".to_string(),
            "type=container".to_string(),
        ];
        for action in &filter.actions {
            args.push("--filter".to_string());
            args.push(format!("event={}", action));
        }

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TrustError::RuntimeUnavailable(format!("failed to run {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TrustError::RuntimeUnavailable("event stream has no stdout".into()))?;
        let lines = BufReader::new(stdout).lines();

        // The child rides along in the stream state so dropping the stream kills it.
        let events = stream::unfold(Some((child, lines)), |state| async move {
            let (child, mut lines) = state?;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => return Some((parse_event_line(&line), Some((child, lines)))),
                    Ok(None) => return None,
                    Err(e) => {
                        return Some((
                            Err(TrustError::RuntimeUnavailable(format!("event stream broke: {}", e))),
                            None,
                        ))
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }

    async fn exec(&self, id: &str, command: &[&str]) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(command.iter().map(|s| s.to_string()));

        let output = self.run(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() && daemon_unreachable(&stderr) {
            return Err(TrustError::RuntimeUnavailable(stderr.trim().to_string()));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }

    async fn copy_file_into(&self, id: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            local_path.display().to_string(),
            format!("{}:{}", id, remote_path),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(self.failure(&args, &output));
        }
        Ok(())
    }
}

fn daemon_unreachable(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("error during connect")
        || stderr.contains("Is the docker daemon running")
}

fn ps_args(filter: &ContainerFilter) -> Vec<String> {
    let mut args = vec![
        "ps".to_string(),
        "--no-trunc".to_string(),
        "--format".to_string(),
        "{{json .}}".to_string(),
    ];
    if !filter.running_only {
        args.push("--all".to_string());
    }
    if let Some((key, value)) = &filter.label {
        args.push("--filter".to_string());
        args.push(match value {
            Some(value) => format!("label={}={}", key, value),
            None => format!("label={}", key),
        });
    }
    if let Some(name) = &filter.name {
        args.push("--filter".to_string());
        args.push(format!("name={}", name));
    }
    args
}

#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

fn parse_ps_line(line: &str) -> Result<ContainerSummary> {
    let row: PsRow = serde_json::from_str(line)
        .map_err(|e| TrustError::Command(format!("bad container listing row: {}", e)))?;

    Ok(ContainerSummary {
        id: row.id,
        name: row.names.split(',').next().unwrap_or_default().to_string(),
        running: row.state.eq_ignore_ascii_case("running"),
        labels: parse_labels(&row.labels),
    })
}

/// `docker ps` joins labels with bare commas, so a fragment without `=`
/// continues the previous value. Exact values come from `inspect`.
fn parse_labels(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut last_key: Option<String> = None;

    for fragment in raw.split(',') {
        match (fragment.split_once('='), &last_key) {
            (Some((key, value)), _) => {
                labels.insert(key.to_string(), value.to_string());
                last_key = Some(key.to_string());
            }
            (None, Some(key)) => {
                if let Some(value) = labels.get_mut(key) {
                    value.push(',');
                    value.push_str(fragment);
                }
            }
            (None, None) if !fragment.is_empty() => {
                labels.insert(fragment.to_string(), String::new());
            }
            (None, None) => {}
        }
    }
    labels
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRow {
    id: String,
    name: String,
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    host_config: Option<InspectHostConfig>,
    #[serde(default)]
    network_settings: Option<InspectNetworkSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

type PortMap = HashMap<String, Option<Vec<serde_json::Value>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    port_bindings: Option<PortMap>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    ports: Option<PortMap>,
}

fn parse_inspect(raw: &str) -> Result<Option<ContainerDetail>> {
    let rows: Vec<InspectRow> = serde_json::from_str(raw)
        .map_err(|e| TrustError::Command(format!("bad inspect output: {}", e)))?;
    let Some(row) = rows.into_iter().next() else {
        return Ok(None);
    };

    let mut published_ports: Vec<u16> = row
        .host_config
        .and_then(|h| h.port_bindings)
        .into_iter()
        .chain(row.network_settings.and_then(|n| n.ports))
        .flat_map(|ports| ports.into_iter())
        .filter(|(_, bindings)| bindings.as_ref().is_some_and(|b| !b.is_empty()))
        .filter_map(|(key, _)| key.split('/').next().and_then(|p| p.parse().ok()))
        .collect();
    published_ports.sort_unstable();
    published_ports.dedup();

    let env = row
        .config
        .env
        .unwrap_or_default()
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry, String::new()),
        })
        .collect();

    Ok(Some(ContainerDetail {
        id: row.id,
        name: row.name.trim_start_matches('/').to_string(),
        running: row.state.running,
        env,
        labels: row.config.labels.unwrap_or_default(),
        published_ports,
    }))
}

#[derive(Debug, Deserialize)]
struct EventRow {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    id: String,
    #[serde(rename = "Actor", default)]
    actor: Option<EventActor>,
}

#[derive(Debug, Deserialize)]
struct EventActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

fn parse_event_line(line: &str) -> Result<ContainerEvent> {
    let row: EventRow = serde_json::from_str(line)
        .map_err(|e| TrustError::Command(format!("bad event: {}", e)))?;

    let (actor_id, name) = match row.actor {
        Some(actor) => {
            let name = actor.attributes.get("name").cloned().unwrap_or_default();
            (actor.id, name)
        }
        None => (String::new(), String::new()),
    };

    let container_id = if actor_id.is_empty() { row.id } else { actor_id };
    if container_id.is_empty() {
        return Err(TrustError::Command("event without container id".into()));
    }

    Ok(ContainerEvent {
        container_id,
        name,
        action: if row.action.is_empty() { row.status } else { row.action },
    })
}
