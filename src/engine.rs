//! Container engine seam
//!
//! [`ContainerEngine`] is the narrow set of imperative calls the runtime
//! driver and the route synchronizer issue against the external container
//! engine. The Docker implementation lives in [`crate::docker`]; tests plug
//! in an in-memory fake.

use crate::definition::ContainerDefinition;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the container engine layer
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Engine unreachable (daemon down, socket missing, connection reset)
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// No container with this name exists
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("{operation} timed out after {}s", after.as_secs())]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },

    #[error("command delivery failed: {0}")]
    CommandDelivery(String),

    /// Engine answered with an error that is none of the above
    #[error("container engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Snapshot of a container as reported by the engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub running: bool,
    pub labels: HashMap<String, String>,
}

/// Imperative lifecycle calls against a named container.
///
/// Implementations must be tolerant where the engine is: stopping an
/// already-stopped container and starting a running one succeed.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Inspect a container; `Ok(None)` when it does not exist
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError>;

    /// Create (but do not start) a container from a definition
    async fn create(&self, definition: &ContainerDefinition) -> Result<(), RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Attach a container to a network; already attached is success
    async fn connect_network(&self, name: &str, network: &str) -> Result<(), RuntimeError>;

    /// Graceful stop, giving the process `timeout` to exit
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Send a signal to the container's main process (SIGKILL when `None`)
    async fn kill(&self, name: &str, signal: Option<&str>) -> Result<(), RuntimeError>;

    /// Remove a container together with its anonymous volumes
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Run a command inside a running container, returning its exit code
    async fn exec(&self, name: &str, user: &str, cmd: Vec<String>) -> Result<i64, RuntimeError>;

    /// Stream log lines: the last `tail` lines, then new ones if `follow`
    fn logs(
        &self,
        name: &str,
        tail: usize,
        follow: bool,
    ) -> BoxStream<'static, Result<String, RuntimeError>>;
}
