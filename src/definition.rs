//! Container definitions
//!
//! [`DefinitionGenerator::generate`] turns a workload descriptor into the
//! declarative unit the container engine applies: image, environment,
//! exposed and published ports, the data volume, and the HTTP routing labels
//! read by the reverse proxy for auxiliary web services. The result is
//! persisted per workload by [`DefinitionArtifacts`] next to the server's
//! data directory.

use crate::config::Config;
use crate::error::{FleetError, FleetResult};
use crate::store::write_atomic;
use crate::workload::{service_router_key, ModpackSource, Workload, MINECRAFT_PORT};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const IMAGE_REPOSITORY: &str = "itzg/minecraft-server";
const DEFAULT_JAVA_TAG: &str = "java21";
const SUPPORTED_JAVA_VERSIONS: &[&str] = &["8", "11", "17", "21"];

const SERVER_TYPES: &[&str] = &[
    "vanilla", "paper", "spigot", "fabric", "forge", "purpur", "velocity", "waterfall",
];
const DEFAULT_SERVER_TYPE: &str = "PAPER";

/// Mount point of the per-server data directory inside the container
pub const CONTAINER_DATA_PATH: &str = "/data";

const DEFINITION_FILE: &str = "container.json";
const GAME_DATA_DIR: &str = "minecraft-server";

/// Backend name of a workload's container; also its DNS name on the shared network
pub fn container_name(workload_id: &str) -> String {
    format!("minecraft-server-{}", workload_id)
}

/// A port bound directly on the host, bypassing the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl VolumeMount {
    /// `host:container` bind specification
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host_path.display(), self.container_path)
    }
}

/// Declarative description of one workload's container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub workload_id: String,
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: Vec<u16>,
    pub published_ports: Vec<PublishedPort>,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub network: String,
    pub restart_policy: String,
}

impl ContainerDefinition {
    /// Short content hash; two definitions with the same digest are identical
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let hash = Sha256::digest(&bytes);
        hex::encode(hash)[..16].to_string()
    }

    /// `KEY=value` pairs in key order
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Ambient configuration the generator needs beyond the descriptor
#[derive(Debug, Clone)]
pub struct DefinitionContext {
    pub base_domain: Option<String>,
    pub mc_prefix: String,
    pub network: String,
    /// Data directory as the container engine's host sees it
    pub host_data_dir: PathBuf,
    pub curseforge_api_key: Option<String>,
}

impl DefinitionContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_domain: config.domain.base_domain().map(str::to_string),
            mc_prefix: config.domain.mc_prefix.clone(),
            network: config.docker.network.clone(),
            host_data_dir: config.paths.host_data_dir().to_path_buf(),
            curseforge_api_key: config.modpacks.curseforge_api_key.clone(),
        }
    }
}

pub struct DefinitionGenerator {
    ctx: DefinitionContext,
}

impl DefinitionGenerator {
    pub fn new(ctx: DefinitionContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &DefinitionContext {
        &self.ctx
    }

    /// Generate the container definition of `workload`.
    ///
    /// Deterministic in `(workload, context)`. Fails only when the base
    /// domain is not configured.
    pub fn generate(&self, workload: &Workload) -> FleetResult<ContainerDefinition> {
        let base_domain = self.ctx.base_domain.as_deref().ok_or_else(|| {
            FleetError::ConfigGeneration("BASE_DOMAIN is not configured".to_string())
        })?;

        let name = container_name(&workload.id);
        let mut env = BTreeMap::new();
        let mut labels = BTreeMap::new();
        let mut exposed_ports = vec![MINECRAFT_PORT];
        let mut published_ports = Vec::new();

        env.insert("EULA".to_string(), "TRUE".to_string());
        env.insert(
            "VERSION".to_string(),
            game_version(&workload.runtime.minecraft_version),
        );
        env.insert("SERVER_PORT".to_string(), MINECRAFT_PORT.to_string());
        env.insert("MEMORY".to_string(), format!("{}M", workload.resources.max_ram));
        env.insert("INIT_MEMORY".to_string(), format!("{}M", workload.resources.min_ram));
        env.insert("MAX_MEMORY".to_string(), format!("{}M", workload.resources.max_ram));
        env.insert("ONLINE_MODE".to_string(), "TRUE".to_string());
        env.insert("CREATE_CONSOLE_IN_PIPE".to_string(), "true".to_string());

        match workload.modpack {
            Some(ref modpack) => match modpack.source {
                ModpackSource::Modrinth => {
                    env.insert("TYPE".to_string(), "MODRINTH".to_string());
                    env.insert("MODRINTH_MODPACK".to_string(), modpack.slug.clone());
                }
                ModpackSource::Curseforge => {
                    env.insert("TYPE".to_string(), "AUTO_CURSEFORGE".to_string());
                    env.insert("CF_SLUG".to_string(), modpack.slug.clone());
                    if let Some(ref key) = self.ctx.curseforge_api_key {
                        env.insert("CF_API_KEY".to_string(), key.clone());
                    }
                }
                // Let the image pick its default rather than guess a type
                ModpackSource::Unknown => {}
            },
            None => {
                env.insert(
                    "TYPE".to_string(),
                    server_type(&workload.runtime.server_type).to_string(),
                );
            }
        }

        labels.insert("minecraft.server.id".to_string(), workload.id.clone());
        labels.insert(
            "minecraft.server.name".to_string(),
            if workload.name.trim().is_empty() {
                "unnamed".to_string()
            } else {
                workload.name.clone()
            },
        );
        labels.insert(
            "minecraft.server.domain".to_string(),
            format!("{}.{}.{}", workload.subdomain, self.ctx.mc_prefix, base_domain),
        );

        let mut proxied = false;
        for (service_name, service) in &workload.services {
            exposed_ports.push(service.port);

            let Some(prefix) = service.routed() else {
                published_ports.push(PublishedPort {
                    host_port: service.port,
                    container_port: service.port,
                    protocol: "udp".to_string(),
                });
                continue;
            };

            proxied = true;
            let router = router_name(&workload.id, service_name);
            let host = format!("{}-{}.{}", prefix, workload.subdomain, base_domain);
            let rule = format!("Host(`{}`)", host);

            if service.enable_ssl {
                let redirect = format!("{}-redirect", router);
                labels.insert(format!("traefik.http.routers.{}-http.rule", router), rule.clone());
                labels.insert(
                    format!("traefik.http.routers.{}-http.entrypoints", router),
                    "web".to_string(),
                );
                labels.insert(
                    format!("traefik.http.routers.{}-http.middlewares", router),
                    redirect.clone(),
                );
                labels.insert(
                    format!("traefik.http.middlewares.{}.redirectscheme.scheme", redirect),
                    "https".to_string(),
                );
                labels.insert(
                    format!("traefik.http.middlewares.{}.redirectscheme.permanent", redirect),
                    "true".to_string(),
                );
                labels.insert(format!("traefik.http.routers.{}.rule", router), rule);
                labels.insert(
                    format!("traefik.http.routers.{}.entrypoints", router),
                    "websecure".to_string(),
                );
                labels.insert(format!("traefik.http.routers.{}.tls", router), "true".to_string());
                labels.insert(
                    format!("traefik.http.routers.{}.tls.certresolver", router),
                    "letsencrypt".to_string(),
                );
            } else {
                labels.insert(format!("traefik.http.routers.{}.rule", router), rule);
                labels.insert(
                    format!("traefik.http.routers.{}.entrypoints", router),
                    "web".to_string(),
                );
            }

            labels.insert(
                format!("traefik.http.services.{}.loadbalancer.server.port", router),
                service.port.to_string(),
            );
            labels.insert(format!("traefik.http.routers.{}.service", router), router);
        }

        if proxied {
            labels.insert("traefik.enable".to_string(), "true".to_string());
        }

        let definition = ContainerDefinition {
            workload_id: workload.id.clone(),
            name,
            image: image_for(&workload.runtime.java_version),
            env,
            exposed_ports,
            published_ports,
            labels,
            volumes: vec![VolumeMount {
                host_path: self
                    .ctx
                    .host_data_dir
                    .join("servers")
                    .join(&workload.id)
                    .join(GAME_DATA_DIR),
                container_path: CONTAINER_DATA_PATH.to_string(),
            }],
            network: self.ctx.network.clone(),
            restart_policy: "unless-stopped".to_string(),
        };

        debug!(
            workload_id = %workload.id,
            image = %definition.image,
            services = workload.services.len(),
            "Generated container definition"
        );

        Ok(definition)
    }
}

/// Base image for a java version; unknown versions get the newest runtime
pub fn image_for(java_version: &str) -> String {
    let version = java_version.trim();
    if SUPPORTED_JAVA_VERSIONS.contains(&version) {
        format!("{}:java{}", IMAGE_REPOSITORY, version)
    } else {
        format!("{}:{}", IMAGE_REPOSITORY, DEFAULT_JAVA_TAG)
    }
}

/// Image `TYPE` for a server type; unknown types run Paper
pub fn server_type(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    if SERVER_TYPES.contains(&lower.as_str()) {
        lower.to_uppercase()
    } else {
        DEFAULT_SERVER_TYPE.to_string()
    }
}

fn game_version(version: &str) -> String {
    let version = version.trim();
    if version.is_empty() || version.eq_ignore_ascii_case("latest") {
        "LATEST".to_string()
    } else {
        version.to_string()
    }
}

fn router_name(workload_id: &str, service_name: &str) -> String {
    format!("{}-{}", workload_id, service_router_key(service_name))
}

/// On-disk layout of per-workload state under the data directory:
/// `servers/{id}/container.json` and `servers/{id}/minecraft-server/`
#[derive(Debug, Clone)]
pub struct DefinitionArtifacts {
    data_dir: PathBuf,
}

impl DefinitionArtifacts {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn server_dir(&self, workload_id: &str) -> PathBuf {
        self.data_dir.join("servers").join(workload_id)
    }

    pub fn definition_path(&self, workload_id: &str) -> PathBuf {
        self.server_dir(workload_id).join(DEFINITION_FILE)
    }

    /// Game data directory mounted at `/data`
    pub fn game_data_dir(&self, workload_id: &str) -> PathBuf {
        self.server_dir(workload_id).join(GAME_DATA_DIR)
    }

    /// Persist a definition and make sure its data directory exists
    pub async fn save(&self, definition: &ContainerDefinition) -> FleetResult<()> {
        let game_dir = self.game_data_dir(&definition.workload_id);
        tokio::fs::create_dir_all(&game_dir)
            .await
            .map_err(|e| FleetError::store_io(&game_dir, e))?;

        let path = self.definition_path(&definition.workload_id);
        let json = serde_json::to_vec_pretty(definition).map_err(|e| FleetError::store_io(&path, e))?;
        write_atomic(&path, &json)
            .await
            .map_err(|e| FleetError::store_io(&path, e))
    }

    pub async fn load(&self, workload_id: &str) -> FleetResult<Option<ContainerDefinition>> {
        let path = self.definition_path(workload_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| FleetError::store_io(&path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FleetError::store_io(&path, e)),
        }
    }

    /// Delete the workload's definition and all of its data; missing is fine
    pub async fn remove_all(&self, workload_id: &str) -> FleetResult<()> {
        let dir = self.server_dir(workload_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::store_io(&dir, e)),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
