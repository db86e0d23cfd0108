use std::sync::Arc;

use log::info;
use tokio::sync::broadcast;

use crate::artifacts::catalog::{self, ArtifactRef, Platform};
use crate::artifacts::store::ArtifactStore;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::events::{EventBus, RuntimeEvent};
use crate::server::registry::{ServerInstance, ServerRegistry};
use crate::server::supervisor::ProcessSupervisor;

/// Facade wiring the catalog, artifact store, registry and supervisor
/// together into the command surface the host application calls.
///
/// Constructed once at host startup; the registry it owns is torn down with
/// it, so servers it started should be stopped (`stop_all_servers`) before
/// the host exits.
pub struct RuntimeManager {
    platform: Platform,
    store: ArtifactStore,
    supervisor: ProcessSupervisor,
    events: EventBus,
}

impl RuntimeManager {
    pub fn new(config: RuntimeConfig, platform: Platform) -> Self {
        let events = EventBus::default();
        let registry = Arc::new(ServerRegistry::new());
        let store = ArtifactStore::new(&config, events.clone());
        let supervisor = ProcessSupervisor::new(config, registry, events.clone());
        Self {
            platform,
            store,
            supervisor,
            events,
        }
    }

    /// Subscribe to download progress and server lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        self.supervisor.registry()
    }

    /// Install a runtime bundle if it is not installed already.
    pub async fn ensure_runtime_installed(&self, id: &str, version: &str) -> Result<(), RuntimeError> {
        self.ensure_installed(&ArtifactRef::runtime(id, version)).await
    }

    /// Install a model's weights if they are not installed already.
    pub async fn ensure_model_installed(&self, id: &str, version: &str) -> Result<(), RuntimeError> {
        self.ensure_installed(&ArtifactRef::model(id, version)).await
    }

    async fn ensure_installed(&self, reference: &ArtifactRef) -> Result<(), RuntimeError> {
        let entry = catalog::find_entry(reference)
            .ok_or_else(|| RuntimeError::ArtifactNotFound(reference.to_string()))?;
        self.store.ensure_installed(&entry, self.platform).await
    }

    /// Cancel an in-flight download. Returns false when nothing was active.
    pub fn cancel_download(&self, reference: &ArtifactRef) -> bool {
        self.store.cancel_download(reference)
    }

    /// Start an inference server for a catalogued model, installing nothing:
    /// both the model and its runtime dependency must already be installed.
    pub async fn start_server(&self, model_id: &str) -> Result<ServerInstance, RuntimeError> {
        let entry = catalog::find_model(model_id)
            .ok_or_else(|| RuntimeError::ArtifactNotFound(model_id.to_string()))?;
        let runtime = entry
            .runtime_dependency
            .clone()
            .ok_or_else(|| RuntimeError::UnsupportedBackend(model_id.to_string()))?;
        self.supervisor
            .start(&entry.reference, &runtime, &self.store)
            .await
    }

    /// Stop a server instance by pid. Idempotent.
    pub async fn stop_server(&self, pid: u32) -> Result<(), RuntimeError> {
        self.supervisor.stop(pid).await
    }

    /// Stop every registered server. Call before host shutdown or
    /// [`clear_all`](Self::clear_all).
    pub async fn stop_all_servers(&self) {
        self.supervisor.stop_all().await;
    }

    pub fn list_servers(&self) -> Vec<ServerInstance> {
        self.supervisor.registry().list()
    }

    pub fn list_installed(&self) -> Vec<ArtifactRef> {
        self.store.list_installed()
    }

    /// Delete an installed artifact. Refused while a server references it.
    pub fn delete_installed(&self, reference: &ArtifactRef) -> Result<(), RuntimeError> {
        self.store.remove(reference, self.supervisor.registry())
    }

    /// Remove installed artifacts the current catalog no longer references.
    pub fn garbage_collect(&self) -> Vec<ArtifactRef> {
        let live = catalog::catalog_refs();
        let removed = self
            .store
            .garbage_collect(&live, self.supervisor.registry());
        if !removed.is_empty() {
            info!("Garbage collected {} stale artifact(s)", removed.len());
        }
        removed
    }

    /// Destructive full reset of the artifact root. Stop all servers first.
    pub fn clear_all(&self) -> Result<(), RuntimeError> {
        self.store.clear_all()
    }
}
