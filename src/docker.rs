//! Docker implementation of the container engine seam

use crate::config::PullPolicy;
use crate::definition::ContainerDefinition;
use crate::engine::{ContainerEngine, ContainerInfo, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Client-side timeout for a single Docker API call
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Lines buffered between the Docker log reader and its consumer
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Drives containers through the Docker Engine API
pub struct DockerEngine {
    client: Docker,
    pull_policy: PullPolicy,
}

impl DockerEngine {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(docker_host: Option<&str>, pull_policy: PullPolicy) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Game servers cannot be managed until dockerd is reachable.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            pull_policy,
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        let mut tried_paths = Vec::new();

        for (name, path) in &socket_paths {
            if path.is_empty() || path.starts_with("/.") || path.starts_with("/podman") {
                continue; // HOME or XDG_RUNTIME_DIR unset
            }

            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => {
                        if client.ping().await.is_ok() {
                            return Ok(client);
                        }
                        tried_paths.push(format!("{} ({}) - daemon not responding", path, name));
                    }
                    Err(e) => {
                        tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                    }
                }
            }
        }

        match Docker::connect_with_socket_defaults() {
            Ok(client) => Ok(client),
            Err(e) => {
                let tried_info = if tried_paths.is_empty() {
                    "No Docker socket found at common locations".to_string()
                } else {
                    format!("Tried:\n  - {}", tried_paths.join("\n  - "))
                };

                anyhow::bail!(
                    "Cannot connect to Docker daemon. {}\n\n\
                     Set DOCKER_HOST or [docker] host in the configuration.\n\n\
                     Underlying error: {}",
                    tried_info, e
                )
            }
        }
    }

    /// Pull an image if needed based on the pull policy
    async fn pull_image_if_needed(&self, image: &str) -> Result<(), RuntimeError> {
        let should_pull = match self.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    return Err(RuntimeError::Rejected {
                        status: 404,
                        message: format!(
                            "image '{}' not found locally and pull_policy is 'never'",
                            image
                        ),
                    });
                }
                false
            }
            PullPolicy::IfNotPresent => match self.client.inspect_image(image).await {
                Ok(_) => {
                    debug!(image, "Image exists locally, skipping pull");
                    false
                }
                Err(_) => true,
            },
        };

        if !should_pull {
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(RuntimeError::Rejected {
                            status: 500,
                            message: format!("failed to pull '{}': {}", image, error),
                        });
                    }
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                }
                Err(e) => return Err(classify("pull", image, e)),
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }
}

/// Map a bollard error onto the engine taxonomy
fn classify(operation: &'static str, name: &str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(name.to_string()),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Rejected {
            status: status_code,
            message,
        },
        DockerError::RequestTimeoutError => RuntimeError::TimedOut {
            operation,
            after: Duration::from_secs(CLIENT_TIMEOUT_SECS),
        },
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

/// Split a raw log frame into trimmed, non-empty lines
fn frame_lines(output: LogOutput) -> Vec<String> {
    let bytes = match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message } => message,
        LogOutput::StdIn { .. } => return Vec::new(),
    };

    String::from_utf8_lossy(&bytes)
        .lines()
        .map(|l| l.trim_end().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Exposed-port and port-binding maps for a definition
fn port_maps(
    definition: &ContainerDefinition,
) -> (
    HashMap<String, HashMap<(), ()>>,
    HashMap<String, Option<Vec<PortBinding>>>,
) {
    let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

    for port in &definition.exposed_ports {
        exposed.insert(format!("{}/tcp", port), HashMap::new());
    }

    for published in &definition.published_ports {
        let key = format!("{}/{}", published.container_port, published.protocol);
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(published.host_port.to_string()),
            }]),
        );
    }

    (exposed, bindings)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(ContainerInfo {
                running: info.state.and_then(|s| s.running).unwrap_or(false),
                labels: info.config.and_then(|c| c.labels).unwrap_or_default(),
            })),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(classify("inspect", name, e)),
        }
    }

    async fn create(&self, definition: &ContainerDefinition) -> Result<(), RuntimeError> {
        self.pull_image_if_needed(&definition.image).await?;

        let (exposed_ports, port_bindings) = port_maps(definition);

        let host_config = HostConfig {
            binds: Some(definition.volumes.iter().map(|v| v.bind()).collect()),
            port_bindings: Some(port_bindings),
            network_mode: Some(definition.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(definition.image.clone()),
            env: Some(definition.env_list()),
            exposed_ports: Some(exposed_ports),
            labels: Some(
                definition
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: definition.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| classify("create", &definition.name, e))?;

        info!(
            container = %definition.name,
            container_id = %response.id,
            image = %definition.image,
            "Created Docker container"
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container = name, "Started Docker container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = name, "Container was already running");
                Ok(())
            }
            Err(e) => Err(classify("start", name, e)),
        }
    }

    async fn connect_network(&self, name: &str, network: &str) -> Result<(), RuntimeError> {
        let options = ConnectNetworkOptions {
            container: name,
            endpoint_config: EndpointSettings::default(),
        };

        match self.client.connect_network(network, options).await {
            Ok(_) => {
                debug!(container = name, network, "Connected container to network");
                Ok(())
            }
            Err(e) if already_attached(&e) => {
                debug!(container = name, network, "Container already attached to network");
                Ok(())
            }
            Err(e) => Err(classify("connect network", name, e)),
        }
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(name, Some(options)).await {
            Ok(_) => {
                info!(container = name, "Stopped Docker container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = name, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(classify("stop", name, e)),
        }
    }

    async fn kill(&self, name: &str, signal: Option<&str>) -> Result<(), RuntimeError> {
        let options = signal.map(|signal| KillContainerOptions { signal });

        match self.client.kill_container(name, options).await {
            Ok(_) => {
                info!(container = name, signal = signal.unwrap_or("SIGKILL"), "Signalled Docker container");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(container = name, "Container not running");
                Ok(())
            }
            Err(e) => Err(classify("kill", name, e)),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(_) => {
                info!(container = name, "Removed Docker container");
                Ok(())
            }
            Err(e) => Err(classify("remove", name, e)),
        }
    }

    async fn exec(&self, name: &str, user: &str, cmd: Vec<String>) -> Result<i64, RuntimeError> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            user: Some(user.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(name, options)
            .await
            .map_err(|e| classify("exec", name, e))?;

        if let StartExecResults::Attached { mut output, .. } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify("exec", name, e))?
        {
            while let Some(frame) = output.next().await {
                match frame {
                    Ok(frame) => {
                        for line in frame_lines(frame) {
                            debug!(container = name, output = %line, "Exec output");
                        }
                    }
                    Err(e) => {
                        warn!(container = name, error = %e, "Exec output stream failed");
                        break;
                    }
                }
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify("exec", name, e))?;

        Ok(inspect.exit_code.unwrap_or(0))
    }

    fn logs(
        &self,
        name: &str,
        tail: usize,
        follow: bool,
    ) -> BoxStream<'static, Result<String, RuntimeError>> {
        let (tx, mut rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow,
                stdout: true,
                stderr: true,
                timestamps: false,
                tail: tail.to_string(),
                ..Default::default()
            };

            let mut log_stream = client.logs(&name, Some(options));
            let mut dropped = 0usize;

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(container = %name, "Log reader dropped");
                        break;
                    }
                    item = log_stream.next() => match item {
                        Some(Ok(frame)) => {
                            for line in frame_lines(frame) {
                                // A snapshot reader drains to the end; a live
                                // reader never holds up the daemon stream
                                if !follow {
                                    if tx.send(Ok(line)).await.is_err() {
                                        return;
                                    }
                                    continue;
                                }
                                match offer_line(&tx, line) {
                                    Delivery::Sent => {}
                                    Delivery::Dropped => {
                                        if dropped == 0 {
                                            warn!(container = %name, "Log reader is behind, dropping lines");
                                        }
                                        dropped += 1;
                                    }
                                    Delivery::Closed => return,
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(classify("logs", &name, e))).await;
                            break;
                        }
                        None => {
                            debug!(container = %name, dropped, "Container log stream ended");
                            break;
                        }
                    }
                }
            }
        });

        futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Sent,
    Dropped,
    Closed,
}

/// Hand a line to the log reader without waiting; a full buffer drops it
fn offer_line(tx: &mpsc::Sender<Result<String, RuntimeError>>, line: String) -> Delivery {
    match tx.try_send(Ok(line)) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(_)) => Delivery::Dropped,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

/// Docker answers 403 "endpoint ... already exists" when the container is
/// already on the network; other 403s are real refusals
fn already_attached(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { message, .. } if message.contains("already exists")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{PublishedPort, VolumeMount};
    use std::collections::BTreeMap;

    fn definition() -> ContainerDefinition {
        ContainerDefinition {
            workload_id: "1".to_string(),
            name: "minecraft-server-1".to_string(),
            image: "itzg/minecraft-server:java21".to_string(),
            env: BTreeMap::new(),
            exposed_ports: vec![25565, 8123],
            published_ports: vec![PublishedPort {
                host_port: 24454,
                container_port: 24454,
                protocol: "udp".to_string(),
            }],
            labels: BTreeMap::new(),
            volumes: vec![VolumeMount {
                host_path: "/srv/servers/1/minecraft-server".into(),
                container_path: "/data".to_string(),
            }],
            network: "minecraft-manager_default".to_string(),
            restart_policy: "unless-stopped".to_string(),
        }
    }

    #[test]
    fn test_port_maps() {
        let (exposed, bindings) = port_maps(&definition());

        assert!(exposed.contains_key("25565/tcp"));
        assert!(exposed.contains_key("8123/tcp"));
        assert!(exposed.contains_key("24454/udp"));
        assert_eq!(bindings.len(), 1);

        let binding = bindings["24454/udp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("24454"));
    }

    #[test]
    fn test_classify_errors() {
        let not_found = classify(
            "start",
            "minecraft-server-1",
            DockerError::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(matches!(not_found, RuntimeError::NotFound(_)));

        let rejected = classify(
            "start",
            "minecraft-server-1",
            DockerError::DockerResponseServerError {
                status_code: 500,
                message: "boom".to_string(),
            },
        );
        assert!(matches!(rejected, RuntimeError::Rejected { status: 500, .. }));

        let timed_out = classify("stop", "x", DockerError::RequestTimeoutError);
        assert!(matches!(timed_out, RuntimeError::TimedOut { operation: "stop", .. }));
    }

    #[test]
    fn test_frame_lines() {
        let lines = frame_lines(LogOutput::StdOut {
            message: "[Server] Done (3.2s)!\r\n\n[Server] hello\n".into(),
        });
        assert_eq!(lines, vec!["[Server] Done (3.2s)!", "[Server] hello"]);

        assert!(frame_lines(LogOutput::StdIn { message: "x".into() }).is_empty());
    }

    #[test]
    fn test_only_existing_endpoint_counts_as_attached() {
        let existing = DockerError::DockerResponseServerError {
            status_code: 403,
            message: "endpoint with name minecraft-server-1 already exists in network minecraft-manager_default".to_string(),
        };
        assert!(already_attached(&existing));

        let refused = DockerError::DockerResponseServerError {
            status_code: 403,
            message: "operation not supported for swarm scoped networks".to_string(),
        };
        assert!(!already_attached(&refused));
        assert!(matches!(
            classify("connect network", "minecraft-server-1", refused),
            RuntimeError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn test_offer_line_never_waits_on_a_full_reader() {
        let (tx, mut rx) = mpsc::channel(1);

        assert_eq!(offer_line(&tx, "first".to_string()), Delivery::Sent);
        assert_eq!(offer_line(&tx, "second".to_string()), Delivery::Dropped);
        assert!(matches!(rx.try_recv(), Ok(Ok(ref line)) if line == "first"));
        assert_eq!(offer_line(&tx, "third".to_string()), Delivery::Sent);

        drop(rx);
        assert_eq!(offer_line(&tx, "fourth".to_string()), Delivery::Closed);
    }
}
