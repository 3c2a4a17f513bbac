//! Route table synchronization for the shared subdomain router.
//!
//! [`RouteSynchronizer`] rebuilds the whole hostname → backend table from
//! the workload collection on every call, overwrites the router's routes
//! file and signals the router container to reload it. Nothing is diffed.

use crate::definition::container_name;
use crate::engine::ContainerEngine;
use crate::error::{FleetError, FleetResult};
use crate::store::write_atomic;
use crate::workload::{Workload, MINECRAFT_PORT};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Hostname → `backend:port` table, in the router's routes-file format
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub hostname: String,
    pub backend: String,
}

impl RouteTable {
    /// One entry per workload: `{subdomain}.{mc_domain}` → `{container}:25565`
    pub fn build(workloads: &[Workload], mc_domain: &str) -> Self {
        let mappings = workloads
            .iter()
            .map(|w| {
                (
                    w.public_host(mc_domain),
                    format!("{}:{}", container_name(&w.id), MINECRAFT_PORT),
                )
            })
            .collect();
        Self { mappings }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn entries(&self) -> Vec<RouteEntry> {
        self.mappings
            .iter()
            .map(|(hostname, backend)| RouteEntry {
                hostname: hostname.clone(),
                backend: backend.clone(),
            })
            .collect()
    }

    /// `host=backend,host=backend`, the router's `MAPPING` variable format
    pub fn mapping_string(&self) -> String {
        self.mappings
            .iter()
            .map(|(host, backend)| format!("{}={}", host, backend))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Outcome of one resync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub routes: usize,
    pub reloaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Parent domain of every game hostname (`{prefix}.{base}`)
    pub mc_domain: Option<String>,
    pub routes_file: PathBuf,
    pub container: String,
    pub reload_signal: String,
}

pub struct RouteSynchronizer<E: ContainerEngine> {
    engine: Arc<E>,
    settings: RouterSettings,
    published: RwLock<Option<RouteTable>>,
}

impl<E: ContainerEngine> RouteSynchronizer<E> {
    pub fn new(engine: Arc<E>, settings: RouterSettings) -> Self {
        Self {
            engine,
            settings,
            published: RwLock::new(None),
        }
    }

    /// Recompute, publish and reload.
    ///
    /// Fails when the table cannot be computed or written. A router that
    /// does not acknowledge the reload is only reported in the result.
    pub async fn resync(&self, workloads: &[Workload]) -> FleetResult<SyncReport> {
        let mc_domain = self.settings.mc_domain.as_deref().ok_or_else(|| {
            FleetError::ConfigGeneration("BASE_DOMAIN is not configured".to_string())
        })?;

        let table = RouteTable::build(workloads, mc_domain);
        let json = serde_json::to_vec_pretty(&table)
            .map_err(|e| FleetError::store_io(&self.settings.routes_file, e))?;
        write_atomic(&self.settings.routes_file, &json)
            .await
            .map_err(|e| FleetError::store_io(&self.settings.routes_file, e))?;

        let routes = table.len();
        *self.published.write() = Some(table);

        let report = match self
            .engine
            .kill(&self.settings.container, Some(self.settings.reload_signal.as_str()))
            .await
        {
            Ok(()) => SyncReport {
                routes,
                reloaded: true,
                warning: None,
            },
            Err(e) => {
                warn!(
                    router = %self.settings.container,
                    error = %e,
                    "Router did not reload, routes file is written but not applied"
                );
                SyncReport {
                    routes,
                    reloaded: false,
                    warning: Some(format!("router reload failed: {}", e)),
                }
            }
        };

        info!(routes, reloaded = report.reloaded, "Route table synchronized");
        Ok(report)
    }

    /// Table written by the last successful resync
    pub fn published(&self) -> Option<RouteTable> {
        self.published.read().clone()
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{ResourceLimits, RuntimeSelector};
    use chrono::Utc;

    fn workload(id: &str, sub: &str) -> Workload {
        Workload {
            id: id.to_string(),
            name: sub.to_string(),
            subdomain: sub.to_string(),
            runtime: RuntimeSelector::default(),
            resources: ResourceLimits::default(),
            port: MINECRAFT_PORT,
            services: BTreeMap::new(),
            modpack: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_table() {
        let table = RouteTable::build(
            &[workload("a1", "survival"), workload("b2", "creative")],
            "mc.example.com",
        );

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.mappings["survival.mc.example.com"],
            "minecraft-server-a1:25565"
        );
        assert_eq!(
            table.mapping_string(),
            "creative.mc.example.com=minecraft-server-b2:25565,survival.mc.example.com=minecraft-server-a1:25565"
        );
    }

    #[test]
    fn test_empty_table() {
        let table = RouteTable::build(&[], "mc.example.com");
        assert!(table.is_empty());
        assert_eq!(table.mapping_string(), "");
        assert_eq!(
            serde_json::to_string(&table).unwrap(),
            r#"{"mappings":{}}"#
        );
    }
}
