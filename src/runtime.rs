//! Container runtime driver
//!
//! Per-workload imperative operations on top of a [`ContainerEngine`], plus
//! the registry of live log tails. At most one tail runs per workload;
//! opening a new one cancels and awaits the previous one first, so lines of
//! an old container never reach the new subscriber.

use crate::config::Config;
use crate::definition::{container_name, ContainerDefinition};
use crate::engine::{ContainerEngine, RuntimeError};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Container label carrying the digest of the definition it was created from
pub const DIGEST_LABEL: &str = "craftgate.definition-digest";

/// Helper installed in the server image that writes to the console pipe
const CONSOLE_COMMAND: &str = "mc-send-to-console";

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub network: String,
    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
    pub destroy_timeout: Duration,
    pub command_timeout: Duration,
    /// History lines replayed when a tail opens
    pub log_tail_lines: usize,
    /// User console commands run as inside the container
    pub command_user: String,
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            network: config.docker.network.clone(),
            stop_timeout: config.lifecycle.stop_timeout(),
            kill_timeout: config.lifecycle.kill_timeout(),
            destroy_timeout: config.lifecycle.destroy_timeout(),
            command_timeout: config.lifecycle.command_timeout(),
            log_tail_lines: config.lifecycle.log_tail_lines,
            command_user: "1000".to_string(),
        }
    }
}

struct LogTail {
    generation: u64,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LogTail {
    /// Signal the reader and wait until it can no longer deliver lines
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
        let _ = self.handle.await;
    }
}

type TailRegistry = Arc<DashMap<String, LogTail>>;

/// Handle to one live tail; cancelling a superseded handle is a no-op
pub struct TailHandle {
    workload_id: String,
    generation: u64,
    tails: TailRegistry,
}

impl TailHandle {
    pub fn workload_id(&self) -> &str {
        &self.workload_id
    }

    pub fn is_active(&self) -> bool {
        self.tails
            .get(&self.workload_id)
            .map(|t| t.generation == self.generation && !t.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn cancel(self) {
        let generation = self.generation;
        if let Some((_, tail)) = self
            .tails
            .remove_if(&self.workload_id, |_, t| t.generation == generation)
        {
            tail.stop().await;
        }
    }
}

pub struct RuntimeDriver<E: ContainerEngine> {
    engine: Arc<E>,
    settings: DriverSettings,
    tails: TailRegistry,
    next_generation: AtomicU64,
}

impl<E: ContainerEngine> RuntimeDriver<E> {
    pub fn new(engine: Arc<E>, settings: DriverSettings) -> Self {
        Self {
            engine,
            settings,
            tails: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Make sure a container built from `definition` exists.
    ///
    /// Creates it when missing. A stopped container created from a different
    /// definition is replaced; a running one is left alone until it stops.
    pub async fn ensure_definition_applied(
        &self,
        definition: &ContainerDefinition,
    ) -> Result<(), RuntimeError> {
        let digest = definition.digest();
        let mut labelled = definition.clone();
        labelled.labels.insert(DIGEST_LABEL.to_string(), digest.clone());

        match self.engine.inspect(&definition.name).await? {
            None => {
                info!(workload_id = %definition.workload_id, "Creating container");
                self.engine.create(&labelled).await
            }
            Some(info) if info.running => {
                debug!(workload_id = %definition.workload_id, "Container already running");
                Ok(())
            }
            Some(info) if info.labels.get(DIGEST_LABEL) != Some(&digest) => {
                info!(
                    workload_id = %definition.workload_id,
                    "Container definition changed, recreating container"
                );
                match self.engine.remove(&definition.name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.engine.create(&labelled).await
            }
            Some(_) => Ok(()),
        }
    }

    /// Start the container and attach it to the shared network
    pub async fn start(&self, workload_id: &str) -> Result<(), RuntimeError> {
        let name = container_name(workload_id);
        self.engine.start(&name).await?;
        self.engine
            .connect_network(&name, &self.settings.network)
            .await?;
        info!(workload_id, container = %name, "Container started");
        Ok(())
    }

    /// Graceful stop. Returns once the container exited or the grace period
    /// plus the kill allowance elapsed. The engine may kill the container
    /// when the grace period runs out; the driver sends no kill of its own.
    pub async fn stop(&self, workload_id: &str) -> Result<(), RuntimeError> {
        let name = container_name(workload_id);
        let bound = self.settings.stop_timeout + self.settings.kill_timeout;

        match tokio::time::timeout(bound, self.engine.stop(&name, self.settings.stop_timeout)).await {
            Ok(Ok(())) | Ok(Err(RuntimeError::NotFound(_))) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::TimedOut {
                operation: "stop",
                after: bound,
            }),
        }
    }

    /// Immediate termination; no container is not an error
    pub async fn kill(&self, workload_id: &str) -> Result<(), RuntimeError> {
        let name = container_name(workload_id);
        let bound = self.settings.kill_timeout;

        match tokio::time::timeout(bound, self.engine.kill(&name, None)).await {
            Ok(Ok(())) | Ok(Err(RuntimeError::NotFound(_))) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::TimedOut {
                operation: "kill",
                after: bound,
            }),
        }
    }

    /// Remove the container and its anonymous volumes; nothing to remove is fine
    pub async fn destroy(&self, workload_id: &str) -> Result<(), RuntimeError> {
        self.cancel_tail(workload_id).await;

        let name = container_name(workload_id);
        let bound = self.settings.destroy_timeout;

        match tokio::time::timeout(bound, self.engine.remove(&name)).await {
            Ok(Ok(())) | Ok(Err(RuntimeError::NotFound(_))) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::TimedOut {
                operation: "destroy",
                after: bound,
            }),
        }
    }

    /// Write one line to the server console
    pub async fn send_command(&self, workload_id: &str, text: &str) -> Result<(), RuntimeError> {
        if !self.is_running(workload_id).await {
            return Err(RuntimeError::CommandDelivery(format!(
                "server {} is not running",
                workload_id
            )));
        }

        let name = container_name(workload_id);
        let cmd = vec![CONSOLE_COMMAND.to_string(), text.to_string()];
        let bound = self.settings.command_timeout;

        let exit_code = match tokio::time::timeout(
            bound,
            self.engine.exec(&name, &self.settings.command_user, cmd),
        )
        .await
        {
            Ok(Ok(code)) => code,
            Ok(Err(RuntimeError::NotFound(_))) => {
                return Err(RuntimeError::CommandDelivery(format!(
                    "server {} has no container",
                    workload_id
                )))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(RuntimeError::TimedOut {
                    operation: "command",
                    after: bound,
                })
            }
        };

        if exit_code != 0 {
            return Err(RuntimeError::CommandDelivery(format!(
                "{} exited with status {}",
                CONSOLE_COMMAND, exit_code
            )));
        }

        debug!(workload_id, command = text, "Console command delivered");
        Ok(())
    }

    /// Whether the container is running; engine errors count as not running
    pub async fn is_running(&self, workload_id: &str) -> bool {
        match self.engine.inspect(&container_name(workload_id)).await {
            Ok(Some(info)) => info.running,
            Ok(None) => false,
            Err(e) => {
                debug!(workload_id, error = %e, "Inspect failed, reporting not running");
                false
            }
        }
    }

    /// Follow the container log, replaying recent history first.
    ///
    /// `on_line` is called in arrival order from a background task. Any
    /// previous tail of the same workload is cancelled before this returns.
    pub async fn tail_logs<F>(&self, workload_id: &str, on_line: F) -> TailHandle
    where
        F: Fn(String) + Send + 'static,
    {
        self.cancel_tail(workload_id).await;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut stream = self.engine.logs(
            &container_name(workload_id),
            self.settings.log_tail_lines,
            true,
        );

        let tails = self.tails.clone();
        let id = workload_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(workload_id = %id, "Log tail cancelled");
                        break;
                    }
                    item = stream.next() => match item {
                        Some(Ok(line)) => on_line(line),
                        Some(Err(e)) => {
                            warn!(workload_id = %id, error = %e, "Log tail failed");
                            break;
                        }
                        None => {
                            debug!(workload_id = %id, "Log tail ended");
                            break;
                        }
                    }
                }
            }
            tails.remove_if(&id, |_, t| t.generation == generation);
        });

        let tail = LogTail {
            generation,
            shutdown: shutdown_tx,
            handle,
        };
        if let Some(previous) = self.tails.insert(workload_id.to_string(), tail) {
            previous.stop().await;
        }

        TailHandle {
            workload_id: workload_id.to_string(),
            generation,
            tails: self.tails.clone(),
        }
    }

    /// Cancel the live tail of a workload, if any, and wait for it to finish
    pub async fn cancel_tail(&self, workload_id: &str) {
        if let Some((_, tail)) = self.tails.remove(workload_id) {
            tail.stop().await;
            debug!(workload_id, "Cancelled log tail");
        }
    }

    pub fn has_active_tail(&self, workload_id: &str) -> bool {
        self.tails
            .get(workload_id)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Point-in-time snapshot of the last `max_lines` lines.
    /// Empty when the workload never ran or the engine is unreachable.
    pub async fn fetch_logs(&self, workload_id: &str, max_lines: usize) -> Vec<String> {
        let mut stream = self
            .engine
            .logs(&container_name(workload_id), max_lines, false);
        let mut lines = Vec::new();

        while let Some(item) = stream.next().await {
            match item {
                Ok(line) => lines.push(line),
                Err(RuntimeError::NotFound(_)) => return Vec::new(),
                Err(e) => {
                    debug!(workload_id, error = %e, "Log snapshot failed");
                    return Vec::new();
                }
            }
        }

        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        lines
    }
}
