use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::artifacts::catalog::ArtifactRef;

/// Lifecycle state of a running inference server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerState {
    Starting,
    Healthy,
    Stopping,
    Stopped,
    Failed,
}

impl ServerState {
    /// Whether the instance still holds its port and pins its artifacts.
    /// `Failed` instances stay registered so callers can notice them, but
    /// their process is gone: they occupy nothing.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ServerState::Starting | ServerState::Healthy | ServerState::Stopping
        )
    }
}

/// Snapshot of a registered inference server instance.
#[derive(Debug, Clone)]
pub struct ServerInstance {
    /// OS process id of the spawned interpreter; the registry key.
    pub pid: u32,
    pub port: u16,
    pub model: ArtifactRef,
    pub runtime: ArtifactRef,
    pub state: ServerState,
    pub started_at: Instant,
    /// Bearer token for the server's authenticated shutdown endpoint.
    pub shutdown_token: String,
}

struct RegisteredServer {
    instance: ServerInstance,
    /// Cancels the readiness loop when the instance is stopped while still
    /// `Starting`.
    cancel: CancellationToken,
}

/// Process-wide table of currently running inference servers.
///
/// In-memory and process-lifetime scoped: nothing persists across host
/// restarts, so servers left running after a host crash are orphans and out
/// of scope here. Constructed once at host startup and handed to the store
/// and supervisor; tests build their own isolated registries.
#[derive(Default)]
pub struct ServerRegistry {
    servers: Mutex<HashMap<u32, RegisteredServer>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance: ServerInstance, cancel: CancellationToken) {
        let mut servers = self.servers.lock().unwrap();
        servers.insert(instance.pid, RegisteredServer { instance, cancel });
    }

    pub fn unregister(&self, pid: u32) {
        let mut servers = self.servers.lock().unwrap();
        servers.remove(&pid);
    }

    /// Update an instance's state. Returns false if the pid is unknown
    /// (already unregistered), which callers treat as a no-op.
    pub fn set_state(&self, pid: u32, state: ServerState) -> bool {
        let mut servers = self.servers.lock().unwrap();
        match servers.get_mut(&pid) {
            Some(entry) => {
                entry.instance.state = state;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, pid: u32) -> Option<ServerInstance> {
        let servers = self.servers.lock().unwrap();
        servers.get(&pid).map(|e| e.instance.clone())
    }

    /// Cancellation token of a registered instance, for preempting its
    /// readiness loop.
    pub fn cancel_token(&self, pid: u32) -> Option<CancellationToken> {
        let servers = self.servers.lock().unwrap();
        servers.get(&pid).map(|e| e.cancel.clone())
    }

    pub fn list(&self) -> Vec<ServerInstance> {
        let servers = self.servers.lock().unwrap();
        servers.values().map(|e| e.instance.clone()).collect()
    }

    /// Whether any non-stopped instance references the artifact. Used by the
    /// store to refuse removing files out from under a running server.
    pub fn is_artifact_in_use(&self, reference: &ArtifactRef) -> bool {
        let servers = self.servers.lock().unwrap();
        servers.values().any(|e| {
            e.instance.state.is_live()
                && (&e.instance.model == reference || &e.instance.runtime == reference)
        })
    }

    /// Whether any non-stopped instance already occupies the port.
    pub fn port_in_use(&self, port: u16) -> bool {
        let servers = self.servers.lock().unwrap();
        servers
            .values()
            .any(|e| e.instance.state.is_live() && e.instance.port == port)
    }

    /// Whether a non-stopped instance exists for the (model, runtime) pair.
    pub fn has_live_instance(&self, model: &ArtifactRef, runtime: &ArtifactRef) -> bool {
        let servers = self.servers.lock().unwrap();
        servers.values().any(|e| {
            e.instance.state.is_live()
                && &e.instance.model == model
                && &e.instance.runtime == runtime
        })
    }
}
