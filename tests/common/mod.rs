//! Shared fixtures: an in-memory container engine and a controller wired to it

#![allow(dead_code)]

use async_trait::async_trait;
use craftgate::config::Config;
use craftgate::controller::WorkloadController;
use craftgate::definition::ContainerDefinition;
use craftgate::engine::{ContainerEngine, ContainerInfo, RuntimeError};
use craftgate::events::EventBus;
use craftgate::workload::CreateWorkload;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const ROUTER: &str = "mc-router";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub running: bool,
    pub definition: Option<ContainerDefinition>,
    pub labels: HashMap<String, String>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    calls: Vec<String>,
    failures: HashMap<String, RuntimeError>,
    stop_delay: Option<Duration>,
    exec_exit_code: i64,
    execs: Vec<(String, String, Vec<String>)>,
    history: HashMap<String, Vec<String>>,
    followers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

/// Container engine that keeps containers in memory and records every call
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine with a running router container, so reloads succeed
    pub fn with_router() -> Arc<Self> {
        let engine = Self::new();
        engine.state.lock().containers.insert(
            ROUTER.to_string(),
            FakeContainer {
                running: true,
                definition: None,
                labels: HashMap::new(),
            },
        );
        engine
    }

    /// Make every call of `op` fail with `err` until cleared
    pub fn fail(&self, op: &str, err: RuntimeError) {
        self.state.lock().failures.insert(op.to_string(), err);
    }

    pub fn clear_failure(&self, op: &str) {
        self.state.lock().failures.remove(op);
    }

    /// Stop calls block for `delay` before completing
    pub fn delay_stop(&self, delay: Duration) {
        self.state.lock().stop_delay = Some(delay);
    }

    pub fn set_exec_exit_code(&self, code: i64) {
        self.state.lock().exec_exit_code = code;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn execs(&self) -> Vec<(String, String, Vec<String>)> {
        self.state.lock().execs.clone()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(name).cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.container(name).map(|c| c.running).unwrap_or(false)
    }

    /// Make a container stop on its own, as if the server process exited
    pub fn exit(&self, name: &str) {
        if let Some(c) = self.state.lock().containers.get_mut(name) {
            c.running = false;
        }
    }

    /// Append a line to a container's log and deliver it to live followers
    pub fn emit_log(&self, name: &str, line: &str) {
        let mut state = self.state.lock();
        state
            .history
            .entry(name.to_string())
            .or_default()
            .push(line.to_string());
        if let Some(followers) = state.followers.get_mut(name) {
            followers.retain(|tx| tx.send(line.to_string()).is_ok());
        }
    }

    pub fn follower_count(&self, name: &str) -> usize {
        let mut state = self.state.lock();
        match state.followers.get_mut(name) {
            Some(followers) => {
                followers.retain(|tx| !tx.is_closed());
                followers.len()
            }
            None => 0,
        }
    }

    fn record(&self, op: &str, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", op, name));
        match state.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn with_container<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakeContainer) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state.lock();
        match state.containers.get_mut(name) {
            Some(container) => f(container),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        if let Some(err) = self.state.lock().failures.get("inspect") {
            return Err(err.clone());
        }
        Ok(self.container(name).map(|c| ContainerInfo {
            running: c.running,
            labels: c.labels,
        }))
    }

    async fn create(&self, definition: &ContainerDefinition) -> Result<(), RuntimeError> {
        self.record("create", &definition.name)?;
        let mut state = self.state.lock();
        if state.containers.contains_key(&definition.name) {
            return Err(RuntimeError::Rejected {
                status: 409,
                message: format!("container {} already exists", definition.name),
            });
        }
        state.containers.insert(
            definition.name.clone(),
            FakeContainer {
                running: false,
                definition: Some(definition.clone()),
                labels: definition
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("start", name)?;
        self.with_container(name, |c| {
            c.running = true;
            Ok(())
        })
    }

    async fn connect_network(&self, name: &str, network: &str) -> Result<(), RuntimeError> {
        self.record("connect", &format!("{} {}", name, network))?;
        self.with_container(name, |_| Ok(()))
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.record("stop", name)?;
        let delay = self.state.lock().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_container(name, |c| {
            c.running = false;
            Ok(())
        })
    }

    async fn kill(&self, name: &str, signal: Option<&str>) -> Result<(), RuntimeError> {
        self.record("kill", &format!("{} {}", name, signal.unwrap_or("SIGKILL")))?;
        self.with_container(name, |c| {
            if matches!(signal, None | Some("SIGKILL")) {
                c.running = false;
            }
            Ok(())
        })
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("remove", name)?;
        let mut state = self.state.lock();
        state.followers.remove(name);
        state.history.remove(name);
        match state.containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn exec(&self, name: &str, user: &str, cmd: Vec<String>) -> Result<i64, RuntimeError> {
        self.record("exec", name)?;
        self.with_container(name, |c| {
            if c.running {
                Ok(())
            } else {
                Err(RuntimeError::Rejected {
                    status: 409,
                    message: format!("container {} is not running", name),
                })
            }
        })?;
        let mut state = self.state.lock();
        state.execs.push((name.to_string(), user.to_string(), cmd));
        Ok(state.exec_exit_code)
    }

    fn logs(
        &self,
        name: &str,
        tail: usize,
        follow: bool,
    ) -> BoxStream<'static, Result<String, RuntimeError>> {
        let mut state = self.state.lock();
        if !state.containers.contains_key(name) {
            let err = RuntimeError::NotFound(name.to_string());
            return stream::once(async move { Err(err) }).boxed();
        }

        let history = state.history.get(name).cloned().unwrap_or_default();
        let skip = history.len().saturating_sub(tail);
        let replay = stream::iter(history.into_iter().skip(skip).map(Ok));

        if !follow {
            return replay.boxed();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.followers.entry(name.to_string()).or_default().push(tx);
        let live = stream::poll_fn(move |cx| rx.poll_recv(cx).map(|line| line.map(Ok)));
        replay.chain(live).boxed()
    }
}

/// Controller over a fake engine and a temporary data directory
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub engine: Arc<FakeEngine>,
    pub events: EventBus,
    pub controller: Arc<WorkloadController<FakeEngine>>,
}

impl Harness {
    pub fn routes_json(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.config.paths.routes_file()).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    pub fn store_json(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.config.paths.store_file()).unwrap();
        serde_json::from_str(&raw).unwrap()
    }
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = dir.path().to_path_buf();
    config.domain.base_domain = Some("example.com".to_string());
    config.lifecycle.stop_timeout_secs = 1;
    config.lifecycle.kill_timeout_secs = 1;
    config.lifecycle.command_timeout_secs = 1;
    config.lifecycle.restart_wait_secs = 1;
    config.lifecycle.restart_poll_interval_ms = 20;
    config
}

pub async fn harness() -> Harness {
    harness_with(FakeEngine::with_router(), |_| {}).await
}

pub async fn harness_with(engine: Arc<FakeEngine>, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);

    let events = EventBus::new(256);
    let controller = WorkloadController::new(&config, Arc::clone(&engine), events.clone());
    controller.initialize().await.unwrap();

    Harness {
        dir,
        config,
        engine,
        events,
        controller,
    }
}

pub fn create_request(name: &str, subdomain: Option<&str>) -> CreateWorkload {
    CreateWorkload {
        name: name.to_string(),
        subdomain: subdomain.map(str::to_string),
        ..Default::default()
    }
}

pub fn container(id: &str) -> String {
    craftgate::definition::container_name(id)
}
