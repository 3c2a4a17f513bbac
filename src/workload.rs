//! Workload descriptors: the declarative record of one managed server
//!
//! The persisted JSON shape (camelCase keys, `additionalPorts` map) is kept
//! compatible with documents written by earlier releases. Older documents
//! may carry a bare port number instead of a service object; those are
//! migrated into [`ServiceSpec`] while deserializing so the rest of the crate
//! only ever sees the canonical form.

use crate::error::{FleetError, FleetResult};
use crate::subdomain;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Port every server listens on inside its container
pub const MINECRAFT_PORT: u16 = 25565;

pub const MIN_NAME_LENGTH: usize = 1;
pub const MAX_NAME_LENGTH: usize = 50;

/// Subdomain prefixes for services stored in the legacy bare-port form,
/// keyed by the upper-cased service name
const LEGACY_SERVICE_PREFIXES: &[(&str, Option<&str>)] = &[
    ("VOICE_CHAT", None),
    ("BLUEMAP", Some("bluemap")),
    ("DYNMAP", Some("dynmap")),
    ("SQUAREMAP", Some("map")),
    ("PLAN", Some("plan")),
    ("GEYSER", None),
];

/// Selects the base image and server flavour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSelector {
    /// Distribution variant (paper, vanilla, fabric, ...)
    #[serde(default = "default_server_type")]
    pub server_type: String,
    /// Distribution version, `latest` for the newest release
    #[serde(default = "default_minecraft_version")]
    pub minecraft_version: String,
    /// Language-runtime version (8, 11, 17, 21)
    #[serde(
        default = "default_java_version",
        deserialize_with = "string_or_number"
    )]
    pub java_version: String,
}

impl Default for RuntimeSelector {
    fn default() -> Self {
        Self {
            server_type: default_server_type(),
            minecraft_version: default_minecraft_version(),
            java_version: default_java_version(),
        }
    }
}

/// Memory limits in megabytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default = "default_max_ram")]
    pub max_ram: u32,
    #[serde(default = "default_min_ram")]
    pub min_ram: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_ram: default_max_ram(),
            min_ram: default_min_ram(),
        }
    }
}

/// An auxiliary endpoint exposed beyond the primary port.
///
/// With a subdomain prefix the service is HTTP-routed through the proxy at
/// `{prefix}-{subdomain}.{baseDomain}`; without one its port is published
/// directly on the host (voice chat, Bedrock bridges and other UDP traffic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub port: u16,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enable_ssl: bool,
}

impl ServiceSpec {
    pub fn routed(&self) -> Option<&str> {
        self.subdomain.as_deref().filter(|s| !s.is_empty())
    }
}

/// Proxy router key of a service: its normalized name, `service` when
/// nothing survives normalization
pub fn service_router_key(service_name: &str) -> String {
    let key = subdomain::normalize(service_name);
    if key.is_empty() {
        "service".to_string()
    } else {
        key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModpackSource {
    Modrinth,
    Curseforge,
    /// Source this release does not know how to install
    #[serde(other)]
    Unknown,
}

/// Modpack selected from a marketplace; overrides the plain server type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModpackRef {
    pub source: ModpackSource,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "id",
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id: Option<String>,
}

/// Persisted descriptor of one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub id: String,
    pub name: String,
    /// DNS label, unique across the store
    #[serde(default)]
    pub subdomain: String,
    #[serde(flatten)]
    pub runtime: RuntimeSelector,
    #[serde(flatten)]
    pub resources: ResourceLimits,
    /// Primary game port inside the container
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(
        default,
        rename = "additionalPorts",
        deserialize_with = "deserialize_services"
    )]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default, rename = "modpack", skip_serializing_if = "Option::is_none")]
    pub modpack: Option<ModpackRef>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl Workload {
    /// Fill fields older documents may lack; applied once on read
    pub fn canonicalize(&mut self) {
        if self.subdomain.is_empty() {
            self.subdomain = subdomain::effective_subdomain(None, &self.name, &self.id);
        }
        if self.port == 0 {
            self.port = MINECRAFT_PORT;
        }
    }

    /// Check every per-workload invariant
    pub fn validate(&self) -> FleetResult<()> {
        validate_name(&self.name)?;

        if self.subdomain.is_empty() {
            return Err(FleetError::Validation(
                "subdomain is empty after normalization".to_string(),
            ));
        }
        if !subdomain::is_valid_subdomain(&self.subdomain) {
            return Err(FleetError::Validation(format!(
                "invalid subdomain '{}': use lowercase letters, digits and inner hyphens, at most {} characters",
                self.subdomain,
                subdomain::MAX_SUBDOMAIN_LENGTH
            )));
        }

        if self.resources.max_ram == 0 || self.resources.min_ram == 0 {
            return Err(FleetError::Validation(
                "memory limits must be greater than 0".to_string(),
            ));
        }
        if self.resources.min_ram > self.resources.max_ram {
            return Err(FleetError::Validation(format!(
                "minRam ({} MB) must not exceed maxRam ({} MB)",
                self.resources.min_ram, self.resources.max_ram
            )));
        }

        validate_services(&self.services, self.port)
    }

    /// Public hostname of the game port: `{subdomain}.{mcDomain}`
    pub fn public_host(&self, mc_domain: &str) -> String {
        format!("{}.{}", self.subdomain, mc_domain)
    }
}

fn validate_name(name: &str) -> FleetResult<()> {
    let len = name.trim().chars().count();
    if !(MIN_NAME_LENGTH..=MAX_NAME_LENGTH).contains(&len) {
        return Err(FleetError::Validation(format!(
            "name must be {}-{} characters",
            MIN_NAME_LENGTH, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

fn validate_services(services: &BTreeMap<String, ServiceSpec>, primary_port: u16) -> FleetResult<()> {
    let mut seen = HashSet::new();
    let mut routers: HashMap<String, &str> = HashMap::new();

    for (name, service) in services {
        if service.port == 0 {
            return Err(FleetError::Validation(format!(
                "service '{}': port must be greater than 0",
                name
            )));
        }
        if service.port == primary_port {
            return Err(FleetError::Validation(format!(
                "service '{}': port {} is reserved for the game server",
                name, primary_port
            )));
        }
        if !seen.insert(service.port) {
            return Err(FleetError::Validation(format!(
                "service '{}': port {} is used by another service",
                name, service.port
            )));
        }
        if let Some(prefix) = service.routed() {
            if !subdomain::is_valid_subdomain(prefix) {
                return Err(FleetError::Validation(format!(
                    "service '{}': invalid subdomain prefix '{}'",
                    name, prefix
                )));
            }

            // TLS services also own the plain-HTTP redirect router
            let key = service_router_key(name);
            let mut owned = vec![key.clone()];
            if service.enable_ssl {
                owned.push(format!("{}-http", key));
            }
            for router in owned {
                if let Some(other) = routers.insert(router.clone(), name) {
                    return Err(FleetError::Validation(format!(
                        "services '{}' and '{}' both map to proxy router '{}'",
                        other, name, router
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Status of a workload; never persisted.
///
/// `Running`/`Stopped` come from the engine, the others are transient
/// states tracked by the controller while an intent is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Killing,
    Deleting,
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadStatus::Stopped => write!(f, "stopped"),
            WorkloadStatus::Starting => write!(f, "starting"),
            WorkloadStatus::Running => write!(f, "running"),
            WorkloadStatus::Stopping => write!(f, "stopping"),
            WorkloadStatus::Killing => write!(f, "killing"),
            WorkloadStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// Descriptor plus its derived status, as returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadView {
    #[serde(flatten)]
    pub workload: Workload,
    pub status: WorkloadStatus,
}

/// Create intent. Omitted fields take the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkload {
    pub name: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub server_type: Option<String>,
    #[serde(default)]
    pub minecraft_version: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub java_version: Option<String>,
    #[serde(default)]
    pub max_ram: Option<u32>,
    #[serde(default)]
    pub min_ram: Option<u32>,
    #[serde(
        default,
        rename = "additionalPorts",
        deserialize_with = "deserialize_services"
    )]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default)]
    pub modpack: Option<ModpackRef>,
}

/// Partial update for `reconfigure`. `modpack: null` clears the modpack.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub server_type: Option<String>,
    #[serde(default)]
    pub minecraft_version: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub java_version: Option<String>,
    #[serde(default)]
    pub max_ram: Option<u32>,
    #[serde(default)]
    pub min_ram: Option<u32>,
    #[serde(
        default,
        rename = "additionalPorts",
        deserialize_with = "deserialize_optional_services"
    )]
    pub services: Option<BTreeMap<String, ServiceSpec>>,
    #[serde(default, deserialize_with = "double_option")]
    pub modpack: Option<Option<ModpackRef>>,
}

/// What a merged update touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateEffects {
    /// The container definition must be regenerated
    pub regenerate: bool,
    /// The proxy route table must be resynchronized
    pub resync_routes: bool,
}

impl WorkloadUpdate {
    /// Merge into a copy of `current` and report which derived views are stale
    pub fn apply(&self, current: &Workload) -> (Workload, UpdateEffects) {
        let mut next = current.clone();

        if let Some(ref name) = self.name {
            next.name = name.trim().to_string();
        }
        if let Some(ref sub) = self.subdomain {
            next.subdomain = subdomain::normalize(sub);
        }
        if let Some(ref t) = self.server_type {
            next.runtime.server_type = t.clone();
        }
        if let Some(ref v) = self.minecraft_version {
            next.runtime.minecraft_version = v.clone();
        }
        if let Some(ref j) = self.java_version {
            next.runtime.java_version = j.clone();
        }
        if let Some(max) = self.max_ram {
            next.resources.max_ram = max;
        }
        if let Some(min) = self.min_ram {
            next.resources.min_ram = min;
        }
        if let Some(ref services) = self.services {
            next.services = services.clone();
        }
        if let Some(ref modpack) = self.modpack {
            next.modpack = modpack.clone();
        }

        let resync_routes = next.name != current.name || next.subdomain != current.subdomain;
        let regenerate = resync_routes
            || next.services != current.services
            || next.runtime != current.runtime
            || next.modpack != current.modpack
            || next.resources != current.resources;

        (
            next,
            UpdateEffects {
                regenerate,
                resync_routes,
            },
        )
    }
}

// Default value functions
fn default_server_type() -> String {
    "paper".to_string()
}

fn default_minecraft_version() -> String {
    "latest".to_string()
}

fn default_java_version() -> String {
    "21".to_string()
}

fn default_max_ram() -> u32 {
    2048
}

fn default_min_ram() -> u32 {
    1024
}

fn default_port() -> u16 {
    MINECRAFT_PORT
}

// === Legacy-tolerant deserialization ===

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

impl NumberOrString {
    fn into_string(self) -> String {
        match self {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::Text(s) => s,
        }
    }

    fn as_port(&self) -> u16 {
        match self {
            NumberOrString::Number(n) => u16::try_from(*n).unwrap_or(0),
            NumberOrString::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

/// One entry of `additionalPorts` as found on disk or in a request
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredServicePort {
    /// `{ dynmap: 8123 }`
    Bare(NumberOrString),
    /// `{ dynmap: { port: 8123, subdomain: "dynmap", enableSsl: true } }`
    Full(StoredService),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredService {
    #[serde(default)]
    port: Option<NumberOrString>,
    #[serde(default)]
    subdomain: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    enable_ssl: Option<bool>,
}

fn legacy_prefix(service_name: &str) -> Option<String> {
    let key = service_name.to_uppercase();
    LEGACY_SERVICE_PREFIXES
        .iter()
        .find(|(name, _)| *name == key)
        .and_then(|(_, prefix)| prefix.map(str::to_string))
}

fn migrate_service(name: &str, stored: StoredServicePort) -> Option<ServiceSpec> {
    let spec = match stored {
        StoredServicePort::Bare(port) => ServiceSpec {
            port: port.as_port(),
            subdomain: legacy_prefix(name),
            description: None,
            enable_ssl: false,
        },
        StoredServicePort::Full(service) => ServiceSpec {
            port: service.port.map(|p| p.as_port()).unwrap_or(0),
            subdomain: service
                .subdomain
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            description: service.description,
            enable_ssl: service.enable_ssl.unwrap_or(false),
        },
    };

    // Entries without a usable port were never exposed
    (spec.port != 0).then_some(spec)
}

fn deserialize_services<'de, D>(deserializer: D) -> Result<BTreeMap<String, ServiceSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, StoredServicePort>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, stored)| {
            let spec = migrate_service(&name, stored)?;
            Some((name, spec))
        })
        .collect())
}

fn deserialize_optional_services<'de, D>(
    deserializer: D,
) -> Result<Option<BTreeMap<String, ServiceSpec>>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_services(deserializer).map(Some)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    NumberOrString::deserialize(deserializer).map(NumberOrString::into_string)
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<NumberOrString> = Option::deserialize(deserializer)?;
    Ok(value.map(NumberOrString::into_string))
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`)
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
