//! Workload lifecycle controller
//!
//! Turns user intents into ordered sequences of store mutations,
//! definition regeneration, runtime driver calls and route resyncs.
//!
//! Lifecycle intents for one workload id are serialized by a per-id async
//! mutex; different ids proceed in parallel. Store writes are additionally
//! serialized by a single store lock, since every write replaces the whole
//! document. Transient states (`starting`, `stopping`, `killing`,
//! `deleting`) live only in memory; `running`/`stopped` are always read
//! from the engine.

use crate::config::{Config, WorkloadDefaults};
use crate::definition::{DefinitionArtifacts, DefinitionContext, DefinitionGenerator};
use crate::engine::ContainerEngine;
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::routes::{RouteSynchronizer, RouteTable, RouterSettings, SyncReport};
use crate::runtime::{DriverSettings, RuntimeDriver};
use crate::store::WorkloadStore;
use crate::subdomain;
use crate::workload::{
    CreateWorkload, ModpackRef, ResourceLimits, RuntimeSelector, Workload, WorkloadStatus,
    WorkloadUpdate, WorkloadView, MINECRAFT_PORT,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub restart_wait: Duration,
    pub restart_poll_interval: Duration,
    pub log_snapshot_lines: usize,
    pub defaults: WorkloadDefaults,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            restart_wait: config.lifecycle.restart_wait(),
            restart_poll_interval: config.lifecycle.restart_poll_interval(),
            log_snapshot_lines: config.lifecycle.log_snapshot_lines,
            defaults: config.defaults.clone(),
        }
    }
}

/// Domain settings safe to show to UI clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicConfig {
    pub base_domain: String,
    pub mc_domain: String,
}

pub struct WorkloadController<E: ContainerEngine> {
    store: WorkloadStore,
    store_lock: Mutex<()>,
    generator: DefinitionGenerator,
    artifacts: DefinitionArtifacts,
    driver: RuntimeDriver<E>,
    routes: RouteSynchronizer<E>,
    events: EventBus,
    locks: DashMap<String, Arc<Mutex<()>>>,
    transient: DashMap<String, WorkloadStatus>,
    settings: ControllerSettings,
}

impl<E: ContainerEngine> WorkloadController<E> {
    pub fn new(config: &Config, engine: Arc<E>, events: EventBus) -> Arc<Self> {
        let ctx = DefinitionContext::from_config(config);
        let router = RouterSettings {
            mc_domain: config.domain.mc_domain(),
            routes_file: config.paths.routes_file(),
            container: config.router.container.clone(),
            reload_signal: config.router.reload_signal.clone(),
        };

        Arc::new(Self {
            store: WorkloadStore::new(config.paths.store_file()),
            store_lock: Mutex::new(()),
            generator: DefinitionGenerator::new(ctx),
            artifacts: DefinitionArtifacts::new(&config.paths.data_dir),
            driver: RuntimeDriver::new(engine.clone(), DriverSettings::from_config(config)),
            routes: RouteSynchronizer::new(engine, router),
            events,
            locks: DashMap::new(),
            transient: DashMap::new(),
            settings: ControllerSettings::from_config(config),
        })
    }

    pub fn artifacts(&self) -> &DefinitionArtifacts {
        &self.artifacts
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn driver(&self) -> &RuntimeDriver<E> {
        &self.driver
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Prepare the data directory and store, then publish the route table once
    pub async fn initialize(&self) -> FleetResult<()> {
        let data_dir = self.artifacts.data_dir();
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| FleetError::store_io(data_dir, e))?;

        let workloads = self.store.read_all().await?;
        info!(
            workloads = workloads.len(),
            data_dir = %data_dir.display(),
            "Workload store ready"
        );

        self.resync_quietly(&workloads).await;
        Ok(())
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    fn set_transient(&self, id: &str, status: WorkloadStatus) {
        self.transient.insert(id.to_string(), status);
        self.events.status(id, status);
    }

    /// Leave a transient state and publish the resulting status
    fn settle(&self, id: &str, status: WorkloadStatus) {
        self.transient.remove(id);
        self.events.status(id, status);
    }

    async fn require(&self, id: &str) -> FleetResult<Workload> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| FleetError::WorkloadNotFound(id.to_string()))
    }

    async fn status_of(&self, id: &str) -> WorkloadStatus {
        if let Some(status) = self.transient.get(id) {
            return *status;
        }
        if self.driver.is_running(id).await {
            WorkloadStatus::Running
        } else {
            WorkloadStatus::Stopped
        }
    }

    async fn view(&self, workload: Workload) -> WorkloadView {
        let status = self.status_of(&workload.id).await;
        WorkloadView { workload, status }
    }

    pub async fn list(&self) -> FleetResult<Vec<WorkloadView>> {
        let workloads = self.store.read_all().await?;
        Ok(join_all(workloads.into_iter().map(|w| self.view(w))).await)
    }

    pub async fn get(&self, id: &str) -> FleetResult<WorkloadView> {
        let workload = self.require(id).await?;
        Ok(self.view(workload).await)
    }

    pub async fn get_status(&self, id: &str) -> FleetResult<WorkloadStatus> {
        self.require(id).await?;
        Ok(self.status_of(id).await)
    }

    /// Validate, persist and generate the definition of a new workload.
    /// The container is not started.
    pub async fn create(&self, request: CreateWorkload) -> FleetResult<WorkloadView> {
        let defaults = &self.settings.defaults;
        let id = uuid::Uuid::new_v4().to_string();
        let name = request.name.trim().to_string();

        let workload = Workload {
            subdomain: subdomain::requested_subdomain(request.subdomain.as_deref(), &name),
            id,
            name,
            runtime: RuntimeSelector {
                server_type: request
                    .server_type
                    .unwrap_or_else(|| defaults.server_type.clone()),
                minecraft_version: request
                    .minecraft_version
                    .unwrap_or_else(|| defaults.minecraft_version.clone()),
                java_version: request
                    .java_version
                    .unwrap_or_else(|| defaults.java_version.clone()),
            },
            resources: ResourceLimits {
                max_ram: request.max_ram.unwrap_or(defaults.max_ram),
                min_ram: request.min_ram.unwrap_or(defaults.min_ram),
            },
            port: MINECRAFT_PORT,
            services: request.services,
            modpack: request.modpack,
            created_at: Utc::now(),
        };

        workload.validate()?;
        let definition = self.generator.generate(&workload)?;

        let workloads = {
            let _store = self.store_lock.lock().await;
            let mut workloads = self.store.read_all().await?;
            ensure_unique_subdomain(&workloads, &workload.subdomain, None)?;

            self.artifacts.save(&definition).await?;
            workloads.push(workload.clone());
            if let Err(e) = self.store.write_all(&workloads).await {
                let _ = self.artifacts.remove_all(&workload.id).await;
                return Err(e);
            }
            workloads
        };

        info!(
            workload_id = %workload.id,
            subdomain = %workload.subdomain,
            "Created workload"
        );
        self.events.status(&workload.id, WorkloadStatus::Stopped);
        self.resync_quietly(&workloads).await;

        Ok(WorkloadView {
            workload,
            status: WorkloadStatus::Stopped,
        })
    }

    pub async fn start(&self, id: &str) -> FleetResult<WorkloadStatus> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let workload = self.require(id).await?;
        self.start_locked(&workload).await
    }

    async fn start_locked(&self, workload: &Workload) -> FleetResult<WorkloadStatus> {
        let id = workload.id.as_str();
        self.set_transient(id, WorkloadStatus::Starting);

        if let Err(e) = self.bring_up(workload).await {
            warn!(workload_id = id, error = %e, "Start failed");
            self.transient.remove(id);
            let status = self.status_of(id).await;
            self.events.status(id, status);
            return Err(e);
        }

        let events = self.events.clone();
        let tail_id = id.to_string();
        self.driver
            .tail_logs(id, move |line| events.log(&tail_id, line))
            .await;

        info!(workload_id = id, "Workload running");
        self.settle(id, WorkloadStatus::Running);
        Ok(WorkloadStatus::Running)
    }

    async fn bring_up(&self, workload: &Workload) -> FleetResult<()> {
        let definition = match self.artifacts.load(&workload.id).await? {
            Some(definition) => definition,
            None => {
                debug!(workload_id = %workload.id, "Definition missing, generating");
                let definition = self.generator.generate(workload)?;
                self.artifacts.save(&definition).await?;
                definition
            }
        };

        self.driver.ensure_definition_applied(&definition).await?;
        self.driver.start(&workload.id).await?;
        Ok(())
    }

    /// Graceful stop. Always ends in `stopped`; driver failures are logged.
    pub async fn stop(&self, id: &str) -> FleetResult<WorkloadStatus> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.require(id).await?;
        Ok(self.stop_locked(id).await)
    }

    async fn stop_locked(&self, id: &str) -> WorkloadStatus {
        self.set_transient(id, WorkloadStatus::Stopping);

        if let Err(e) = self.driver.stop(id).await {
            warn!(workload_id = id, error = %e, "Stop did not complete cleanly, recording as stopped");
        }
        self.driver.cancel_tail(id).await;

        info!(workload_id = id, "Workload stopped");
        self.settle(id, WorkloadStatus::Stopped);
        WorkloadStatus::Stopped
    }

    pub async fn kill(&self, id: &str) -> FleetResult<WorkloadStatus> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.require(id).await?;
        self.set_transient(id, WorkloadStatus::Killing);

        if let Err(e) = self.driver.kill(id).await {
            warn!(workload_id = id, error = %e, "Kill failed, recording as stopped");
        }
        self.driver.cancel_tail(id).await;

        info!(workload_id = id, "Workload killed");
        self.settle(id, WorkloadStatus::Stopped);
        Ok(WorkloadStatus::Stopped)
    }

    /// Stop, wait (bounded) for the container to exit, then start.
    /// A container that is recreated here picks up reconfigured settings.
    pub async fn restart(&self, id: &str) -> FleetResult<WorkloadStatus> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let workload = self.require(id).await?;
        self.stop_locked(id).await;

        let deadline = Instant::now() + self.settings.restart_wait;
        while self.driver.is_running(id).await {
            if Instant::now() >= deadline {
                warn!(
                    workload_id = id,
                    waited_secs = self.settings.restart_wait.as_secs(),
                    "Container still running after stop, starting anyway"
                );
                break;
            }
            tokio::time::sleep(self.settings.restart_poll_interval).await;
        }

        self.start_locked(&workload).await
    }

    /// Merge a partial update. Regenerates the definition and resyncs routes
    /// as needed; a running container keeps its old settings until restarted.
    pub async fn reconfigure(&self, id: &str, update: WorkloadUpdate) -> FleetResult<WorkloadView> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let (updated, effects, workloads) = {
            let _store = self.store_lock.lock().await;
            let mut workloads = self.store.read_all().await?;
            let index = workloads
                .iter()
                .position(|w| w.id == id)
                .ok_or_else(|| FleetError::WorkloadNotFound(id.to_string()))?;

            let (updated, effects) = update.apply(&workloads[index]);
            updated.validate()?;
            ensure_unique_subdomain(&workloads, &updated.subdomain, Some(id))?;

            let definition = if effects.regenerate {
                Some(self.generator.generate(&updated)?)
            } else {
                None
            };

            workloads[index] = updated.clone();
            self.store.write_all(&workloads).await?;

            if let Some(definition) = definition {
                self.artifacts.save(&definition).await?;
                debug!(workload_id = id, "Regenerated container definition");
            }
            (updated, effects, workloads)
        };

        info!(
            workload_id = id,
            regenerated = effects.regenerate,
            "Reconfigured workload"
        );
        if effects.resync_routes {
            self.resync_quietly(&workloads).await;
        }

        Ok(self.view(updated).await)
    }

    /// Remove the container, the descriptor and all server data.
    /// Deleting an unknown id succeeds without doing anything.
    pub async fn delete(&self, id: &str) -> FleetResult<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        if self.store.find(id).await?.is_none() {
            debug!(workload_id = id, "Delete of unknown workload, nothing to do");
            self.locks.remove(id);
            return Ok(());
        }

        self.set_transient(id, WorkloadStatus::Deleting);

        if let Err(e) = self.driver.destroy(id).await {
            warn!(workload_id = id, error = %e, "Container removal failed, deleting descriptor anyway");
        }

        let remaining = {
            let _store = self.store_lock.lock().await;
            let result = async {
                let mut workloads = self.store.read_all().await?;
                workloads.retain(|w| w.id != id);
                self.store.write_all(&workloads).await?;
                Ok::<_, FleetError>(workloads)
            }
            .await;

            match result {
                Ok(workloads) => workloads,
                Err(e) => {
                    self.transient.remove(id);
                    let status = self.status_of(id).await;
                    self.events.status(id, status);
                    return Err(e);
                }
            }
        };

        self.resync_quietly(&remaining).await;

        let cleanup = self.artifacts.remove_all(id).await;
        self.transient.remove(id);
        self.events.publish(FleetEvent::Removed {
            workload_id: id.to_string(),
        });
        self.locks.remove(id);
        cleanup?;

        info!(workload_id = id, "Deleted workload");
        Ok(())
    }

    /// Write one line to the server console; the workload must be running
    pub async fn send_command(&self, id: &str, text: &str) -> FleetResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FleetError::Validation("command must not be empty".to_string()));
        }
        if text.contains(['\n', '\r']) {
            return Err(FleetError::Validation(
                "command must be a single line".to_string(),
            ));
        }

        self.require(id).await?;
        if self.status_of(id).await != WorkloadStatus::Running {
            return Err(FleetError::NotRunning(id.to_string()));
        }

        self.driver.send_command(id, text).await?;
        Ok(())
    }

    /// Recent log lines; empty when the server never ran
    pub async fn logs(&self, id: &str, lines: Option<usize>) -> FleetResult<Vec<String>> {
        self.require(id).await?;
        let lines = lines
            .filter(|n| *n > 0)
            .unwrap_or(self.settings.log_snapshot_lines);
        Ok(self.driver.fetch_logs(id, lines).await)
    }

    pub fn is_tailing(&self, id: &str) -> bool {
        self.driver.has_active_tail(id)
    }

    pub async fn get_modpack(&self, id: &str) -> FleetResult<Option<ModpackRef>> {
        Ok(self.require(id).await?.modpack)
    }

    pub async fn set_modpack(&self, id: &str, modpack: ModpackRef) -> FleetResult<WorkloadView> {
        if modpack.slug.trim().is_empty() {
            return Err(FleetError::Validation("modpack slug is required".to_string()));
        }
        self.reconfigure(
            id,
            WorkloadUpdate {
                modpack: Some(Some(modpack)),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn clear_modpack(&self, id: &str) -> FleetResult<WorkloadView> {
        self.reconfigure(
            id,
            WorkloadUpdate {
                modpack: Some(None),
                ..Default::default()
            },
        )
        .await
    }

    /// Rebuild the route table from the store and reload the router
    pub async fn resync_routes(&self) -> FleetResult<SyncReport> {
        let workloads = self.store.read_all().await?;
        self.routes.resync(&workloads).await
    }

    pub fn published_routes(&self) -> Option<RouteTable> {
        self.routes.published()
    }

    async fn resync_quietly(&self, workloads: &[Workload]) {
        match self.routes.resync(workloads).await {
            Ok(report) => {
                if let Some(warning) = report.warning {
                    warn!(warning = %warning, "Route table published without reload");
                }
            }
            Err(e) => warn!(error = %e, "Route resync failed, retry with a manual resync"),
        }
    }

    /// Rewrite every definition artifact from the store
    pub async fn regenerate_all(&self) -> FleetResult<usize> {
        let workloads = self.store.read_all().await?;
        for workload in &workloads {
            let definition = self.generator.generate(workload)?;
            self.artifacts.save(&definition).await?;
            debug!(workload_id = %workload.id, "Regenerated container definition");
        }
        info!(count = workloads.len(), "Regenerated all container definitions");
        Ok(workloads.len())
    }

    pub fn public_config(&self) -> FleetResult<PublicConfig> {
        let ctx = self.generator.context();
        let base_domain = ctx.base_domain.clone().ok_or_else(|| {
            FleetError::ConfigGeneration("BASE_DOMAIN is not configured".to_string())
        })?;
        Ok(PublicConfig {
            mc_domain: format!("{}.{}", ctx.mc_prefix, base_domain),
            base_domain,
        })
    }
}

fn ensure_unique_subdomain(workloads: &[Workload], subdomain: &str, except: Option<&str>) -> FleetResult<()> {
    let taken = workloads
        .iter()
        .any(|w| w.subdomain == subdomain && Some(w.id.as_str()) != except);
    if taken {
        return Err(FleetError::DuplicateSubdomain(subdomain.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

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
    fn test_unique_subdomain() {
        let all = vec![workload("a", "survival"), workload("b", "creative")];

        assert!(ensure_unique_subdomain(&all, "lobby", None).is_ok());
        assert!(matches!(
            ensure_unique_subdomain(&all, "survival", None),
            Err(FleetError::DuplicateSubdomain(_))
        ));
        // Keeping its own subdomain is not a conflict
        assert!(ensure_unique_subdomain(&all, "survival", Some("a")).is_ok());
        assert!(ensure_unique_subdomain(&all, "creative", Some("a")).is_err());
    }
}
