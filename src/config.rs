use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the fleet manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP API configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where state and artifacts live
    #[serde(default)]
    pub paths: PathsConfig,

    /// Public hostname configuration
    #[serde(default)]
    pub domain: DomainConfig,

    /// Container engine connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Shared subdomain router
    #[serde(default)]
    pub router: RouterConfig,

    /// Lifecycle timings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Values used when a create request omits a field
    #[serde(default)]
    pub defaults: WorkloadDefaults,

    /// Marketplace credentials
    #[serde(default)]
    pub modpacks: ModpackConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 5000)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Capacity of the event channel; slow subscribers lose the oldest events
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Directory holding the store document and per-server directories
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// The same directory as seen by the container engine's host, used for
    /// volume binds when the manager itself runs inside a container
    pub host_data_dir: Option<PathBuf>,

    /// Route table artifact read by the router (default: {data_dir}/routes.json)
    pub routes_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            host_data_dir: None,
            routes_file: None,
        }
    }
}

impl PathsConfig {
    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("servers-config.json")
    }

    pub fn routes_file(&self) -> PathBuf {
        self.routes_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("routes.json"))
    }

    /// Data directory as the container engine sees it
    pub fn host_data_dir(&self) -> &Path {
        self.host_data_dir.as_deref().unwrap_or(&self.data_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DomainConfig {
    /// Base domain every public hostname ends in; required to generate
    /// container definitions
    pub base_domain: Option<String>,

    /// Label between server subdomains and the base domain (default: mc)
    #[serde(default = "default_mc_prefix")]
    pub mc_prefix: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            base_domain: None,
            mc_prefix: default_mc_prefix(),
        }
    }
}

impl DomainConfig {
    pub fn base_domain(&self) -> Option<&str> {
        self.base_domain
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }

    /// `{mc_prefix}.{base_domain}`, the parent of every game hostname
    pub fn mc_domain(&self) -> Option<String> {
        self.base_domain()
            .map(|base| format!("{}.{}", self.mc_prefix, base))
    }
}

/// Image pull policy for server images
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before creating a container
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker host URL (default: DOCKER_HOST or the local socket)
    pub host: Option<String>,

    /// Network shared by servers and the router
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            network: default_network(),
            pull_policy: PullPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Container running the subdomain router
    #[serde(default = "default_router_container")]
    pub container: String,

    /// Signal that makes the router re-read its routes file
    #[serde(default = "default_reload_signal")]
    pub reload_signal: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            container: default_router_container(),
            reload_signal: default_reload_signal(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Grace period given to a server to shut down
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Upper bound for a kill to be acknowledged
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_secs: u64,

    /// Upper bound for removing a container on delete
    #[serde(default = "default_destroy_timeout")]
    pub destroy_timeout_secs: u64,

    /// Upper bound for a console command to be delivered
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// How long restart waits for the container to report stopped
    #[serde(default = "default_restart_wait")]
    pub restart_wait_secs: u64,

    #[serde(default = "default_restart_poll_interval")]
    pub restart_poll_interval_ms: u64,

    /// History lines replayed when a live tail opens
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Lines returned by a log snapshot when the caller gives no limit
    #[serde(default = "default_log_snapshot_lines")]
    pub log_snapshot_lines: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout(),
            kill_timeout_secs: default_kill_timeout(),
            destroy_timeout_secs: default_destroy_timeout(),
            command_timeout_secs: default_command_timeout(),
            restart_wait_secs: default_restart_wait(),
            restart_poll_interval_ms: default_restart_poll_interval(),
            log_tail_lines: default_log_tail_lines(),
            log_snapshot_lines: default_log_snapshot_lines(),
        }
    }
}

impl LifecycleConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn restart_wait(&self) -> Duration {
        Duration::from_secs(self.restart_wait_secs)
    }

    pub fn restart_poll_interval(&self) -> Duration {
        Duration::from_millis(self.restart_poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkloadDefaults {
    #[serde(default = "default_java_version")]
    pub java_version: String,

    #[serde(default = "default_server_type")]
    pub server_type: String,

    #[serde(default = "default_minecraft_version")]
    pub minecraft_version: String,

    /// Memory ceiling in MB
    #[serde(default = "default_max_ram")]
    pub max_ram: u32,

    /// Initial heap in MB
    #[serde(default = "default_min_ram")]
    pub min_ram: u32,
}

impl Default for WorkloadDefaults {
    fn default() -> Self {
        Self {
            java_version: default_java_version(),
            server_type: default_server_type(),
            minecraft_version: default_minecraft_version(),
            max_ram: default_max_ram(),
            min_ram: default_min_ram(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModpackConfig {
    /// API key handed to CurseForge modpack installs
    pub curseforge_api_key: Option<String>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_mc_prefix() -> String {
    "mc".to_string()
}

fn default_network() -> String {
    "minecraft-manager_default".to_string()
}

fn default_router_container() -> String {
    "mc-router".to_string()
}

fn default_reload_signal() -> String {
    "SIGHUP".to_string()
}

fn default_stop_timeout() -> u64 {
    60
}

fn default_kill_timeout() -> u64 {
    10
}

fn default_destroy_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    5
}

fn default_restart_wait() -> u64 {
    30
}

fn default_restart_poll_interval() -> u64 {
    1000
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_log_snapshot_lines() -> usize {
    500
}

fn default_java_version() -> String {
    "21".to_string()
}

fn default_server_type() -> String {
    "paper".to_string()
}

fn default_minecraft_version() -> String {
    "latest".to_string()
}

fn default_max_ram() -> u32 {
    2048
}

fn default_min_ram() -> u32 {
    1024
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply the deployment environment variables on top of the file
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BASE_DOMAIN") {
            self.domain.base_domain = Some(v);
        }
        if let Some(v) = var("MC_SUBDOMAIN_PREFIX") {
            self.domain.mc_prefix = v;
        }
        if let Some(v) = var("DOCKER_NETWORK") {
            self.docker.network = v;
        }
        if let Some(v) = var("HOST_DATA_DIR") {
            self.paths.host_data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("CURSEFORGE_API_KEY") {
            self.modpacks.curseforge_api_key = Some(v);
        }
        if let Some(v) = var("CRAFTGATE_BIND") {
            match v.rsplit_once(':') {
                Some((host, port)) => match port.parse() {
                    Ok(port) => {
                        self.server.bind = host.to_string();
                        self.server.port = port;
                    }
                    Err(_) => tracing::warn!(value = %v, "Ignoring CRAFTGATE_BIND with invalid port"),
                },
                None => self.server.bind = v,
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.domain.mc_prefix.trim().is_empty() {
            errors.push("domain.mc_prefix must not be empty".to_string());
        }
        if self.docker.network.trim().is_empty() {
            errors.push("docker.network must not be empty".to_string());
        }
        if self.router.container.trim().is_empty() {
            errors.push("router.container must not be empty".to_string());
        }
        if self.server.event_buffer == 0 {
            errors.push("server.event_buffer must be greater than 0".to_string());
        }
        if self.lifecycle.restart_poll_interval_ms == 0 {
            errors.push("lifecycle.restart_poll_interval_ms must be greater than 0".to_string());
        }
        if self.defaults.min_ram > self.defaults.max_ram {
            errors.push(format!(
                "defaults.min_ram ({}) exceeds defaults.max_ram ({})",
                self.defaults.min_ram, self.defaults.max_ram
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
