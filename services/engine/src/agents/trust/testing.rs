//! In-memory runtime and CA doubles shared by the unit tests.

use async_trait::async_trait;
use base64::Engine;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::ca_api::CaApi;
use super::error::{Result, TrustError};
use super::runtime::ContainerRuntime;
use super::types::{
    ContainerDetail, ContainerEvent, ContainerFilter, ContainerSummary, EventFilter, ExecOutput,
};

pub const UBUNTU_RELEASE: &str = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n";

/// A syntactically valid PEM block with a body unique to `n`.
pub fn sample_pem(n: u32) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(format!("certificate-{n}"));
    format!("-----BEGIN CERTIFICATE-----\n{body}\n-----END CERTIFICATE-----\n")
}

/// Scripted container
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub env: Vec<(String, String)>,
    pub ports: Vec<u16>,
    /// `(substring, exit code, stdout)`, first match wins.
    responses: Vec<(String, i64, String)>,
    /// Exact command after which the container stops.
    stop_after: Option<String>,
}

impl FakeContainer {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            running: true,
            labels: HashMap::new(),
            env: Vec::new(),
            ports: Vec::new(),
            responses: Vec::new(),
            stop_after: None,
        }
    }

    /// Ubuntu container on which every trust step succeeds.
    pub fn ubuntu(id: &str, name: &str) -> Self {
        Self::new(id, name)
            .respond("cat /etc/os-release", 0, UBUNTU_RELEASE)
            .respond("command -v update-ca-certificates", 0, "/usr/sbin/update-ca-certificates")
            .respond("update-ca-certificates", 0, "1 added, 0 removed; done.")
            .respond("curl", 0, "")
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Opted in through the default flag.
    pub fn opted_in(self) -> Self {
        self.env("STEP_CA_TRUST", "true")
    }

    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn stopped(mut self) -> Self {
        self.running = false;
        self
    }

    /// Stop once `command` has run, e.g. right after the liveness exec.
    pub fn stops_after(mut self, command: &str) -> Self {
        self.stop_after = Some(command.to_string());
        self
    }

    pub fn respond(mut self, pattern: &str, exit_code: i64, stdout: &str) -> Self {
        self.responses
            .push((pattern.to_string(), exit_code, stdout.to_string()));
        self
    }

    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            running: self.running,
            labels: self.labels.clone(),
        }
    }

    fn detail(&self) -> ContainerDetail {
        ContainerDetail {
            id: self.id.clone(),
            name: self.name.clone(),
            running: self.running,
            env: self.env.clone(),
            labels: self.labels.clone(),
            published_ports: self.ports.clone(),
        }
    }

    fn matches(&self, filter: &ContainerFilter) -> bool {
        if filter.running_only && !self.running {
            return false;
        }
        if let Some((key, value)) = &filter.label {
            match (self.labels.get(key), value) {
                (None, _) => return false,
                (Some(actual), Some(wanted)) if actual != wanted => return false,
                _ => {}
            }
        }
        if let Some(name) = &filter.name {
            if !self.name.contains(name.as_str()) {
                return false;
            }
        }
        true
    }

    fn run(&self, command: &str) -> ExecOutput {
        if let Some((_, exit_code, stdout)) = self
            .responses
            .iter()
            .find(|(pattern, _, _)| command.contains(pattern.as_str()))
        {
            return ExecOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
                exit_code: *exit_code,
            };
        }

        if command == "true" || command.starts_with("mkdir -p ") {
            return ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            };
        }

        ExecOutput {
            stdout: String::new(),
            stderr: format!("sh: {}: not found", command),
            exit_code: 127,
        }
    }
}

/// In-memory container runtime
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<FakeContainer>>,
    unavailable: AtomicBool,
    execs: Mutex<Vec<(String, String)>>,
    files: Mutex<HashMap<(String, String), String>>,
    copies: Mutex<Vec<String>>,
    event_batches: Mutex<VecDeque<Vec<ContainerEvent>>>,
    subscriptions: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, container: FakeContainer) -> Self {
        self.add(container);
        self
    }

    /// Every call fails as if the daemon were down.
    pub fn unavailable(self) -> Self {
        self.set_unavailable(true);
        self
    }

    /// One event subscription; it yields these events and then ends.
    pub fn with_events(self, events: Vec<ContainerEvent>) -> Self {
        self.event_batches.lock().unwrap().push_back(events);
        self
    }

    pub fn add(&self, container: FakeContainer) {
        let mut containers = self.containers.lock().unwrap();
        containers.retain(|c| c.id != container.id);
        containers.push(container);
    }

    pub fn remove(&self, id: &str) {
        self.containers.lock().unwrap().retain(|c| c.id != id);
    }

    pub fn set_running(&self, id: &str, running: bool) {
        for container in self.containers.lock().unwrap().iter_mut().filter(|c| c.id == id) {
            container.running = running;
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Commands run in `id`, arguments joined by spaces.
    pub fn exec_log(&self, id: &str) -> Vec<String> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| target == id)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn file(&self, id: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(id.to_string(), path.to_string()))
            .cloned()
    }

    pub fn copy_count(&self, id: &str) -> usize {
        self.copies.lock().unwrap().iter().filter(|c| *c == id).count()
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TrustError::RuntimeUnavailable(
                "Cannot connect to the Docker daemon".into(),
            ))
        } else {
            Ok(())
        }
    }

    fn find(&self, id: &str) -> Option<FakeContainer> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id || c.name == id)
            .cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        self.check_available()?;
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.matches(filter))
            .map(FakeContainer::summary)
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerDetail>> {
        self.check_available()?;
        Ok(self.find(id).map(|c| c.detail()))
    }

    async fn stream_events(
        &self,
        _filter: &EventFilter,
    ) -> Result<BoxStream<'static, Result<ContainerEvent>>> {
        self.check_available()?;
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        match self.event_batches.lock().unwrap().pop_front() {
            Some(events) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn exec(&self, id: &str, command: &[&str]) -> Result<ExecOutput> {
        self.check_available()?;
        let joined = command.join(" ");
        let Some(container) = self.find(id) else {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: format!("Error: No such container: {}", id),
                exit_code: 1,
            });
        };
        if !container.running {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: format!("Error response from daemon: container {} is not running", id),
                exit_code: 1,
            });
        }

        self.execs
            .lock()
            .unwrap()
            .push((container.id.clone(), joined.clone()));
        if container.stop_after.as_deref() == Some(joined.as_str()) {
            self.set_running(&container.id, false);
        }
        Ok(container.run(&joined))
    }

    async fn copy_file_into(&self, id: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        self.check_available()?;
        let container = self
            .find(id)
            .filter(|c| c.running)
            .ok_or_else(|| TrustError::Command(format!("No such container: {}", id)))?;

        let content = std::fs::read_to_string(local_path)
            .map_err(|e| TrustError::Command(format!("read {}: {}", local_path.display(), e)))?;
        self.files
            .lock()
            .unwrap()
            .insert((container.id.clone(), remote_path.to_string()), content);
        self.copies.lock().unwrap().push(container.id);
        Ok(())
    }
}

/// Scripted CA API
pub struct FakeCaApi {
    health: Mutex<VecDeque<bool>>,
    default_health: AtomicBool,
    directory: Mutex<VecDeque<std::result::Result<Value, String>>>,
    roots: Mutex<std::result::Result<Vec<String>, String>>,
    intermediates: Mutex<std::result::Result<Vec<String>, String>>,
    trusted: AtomicBool,
    health_calls: AtomicUsize,
    directory_calls: AtomicUsize,
    roots_calls: AtomicUsize,
    intermediates_calls: AtomicUsize,
    verify_calls: AtomicUsize,
}

impl Default for FakeCaApi {
    fn default() -> Self {
        Self {
            health: Mutex::new(VecDeque::new()),
            default_health: AtomicBool::new(true),
            directory: Mutex::new(VecDeque::new()),
            roots: Mutex::new(Ok(vec![sample_pem(1), sample_pem(9)])),
            intermediates: Mutex::new(Ok(vec![sample_pem(2)])),
            trusted: AtomicBool::new(true),
            health_calls: AtomicUsize::new(0),
            directory_calls: AtomicUsize::new(0),
            roots_calls: AtomicUsize::new(0),
            intermediates_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeCaApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_health(&self, healthy: bool) {
        self.health.lock().unwrap().push_back(healthy);
    }

    pub fn set_default_health(&self, healthy: bool) {
        self.default_health.store(healthy, Ordering::SeqCst);
    }

    pub fn push_directory(&self, directory: Result<Value>) {
        self.directory
            .lock()
            .unwrap()
            .push_back(directory.map_err(|e| e.to_string()));
    }

    pub fn set_roots(&self, roots: Result<Vec<String>>) {
        *self.roots.lock().unwrap() = roots.map_err(|e| e.to_string());
    }

    pub fn set_intermediates(&self, intermediates: Result<Vec<String>>) {
        *self.intermediates.lock().unwrap() = intermediates.map_err(|e| e.to_string());
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.trusted.store(trusted, Ordering::SeqCst);
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn directory_calls(&self) -> usize {
        self.directory_calls.load(Ordering::SeqCst)
    }

    pub fn roots_calls(&self) -> usize {
        self.roots_calls.load(Ordering::SeqCst)
    }

    pub fn intermediates_calls(&self) -> usize {
        self.intermediates_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaApi for FakeCaApi {
    async fn health(&self, base_url: &str) -> Result<()> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let healthy = self
            .health
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_health.load(Ordering::SeqCst));
        if healthy {
            Ok(())
        } else {
            Err(TrustError::Http(format!("GET {}/health: connection refused", base_url)))
        }
    }

    async fn acme_directory(&self, _base_url: &str) -> Result<Value> {
        self.directory_calls.fetch_add(1, Ordering::SeqCst);
        self.directory
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"newNonce": "https://step-ca:9000/acme/acme/new-nonce"})))
            .map_err(TrustError::Http)
    }

    async fn roots(&self, _base_url: &str) -> Result<Vec<String>> {
        self.roots_calls.fetch_add(1, Ordering::SeqCst);
        self.roots.lock().unwrap().clone().map_err(TrustError::Http)
    }

    async fn intermediates(&self, _base_url: &str) -> Result<Vec<String>> {
        self.intermediates_calls.fetch_add(1, Ordering::SeqCst);
        self.intermediates
            .lock()
            .unwrap()
            .clone()
            .map_err(TrustError::Http)
    }

    async fn verify_trusted(&self, base_url: &str) -> Result<()> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.trusted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TrustError::Http(format!(
                "GET {}/health: invalid peer certificate: UnknownIssuer",
                base_url
            )))
        }
    }
}
