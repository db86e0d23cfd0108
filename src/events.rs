//! Event stream for download and server lifecycle transitions.
//!
//! Uses discriminated unions (tagged enums) so subscribers can match on a
//! single event stream per concern. Delivery is best-effort over a broadcast
//! channel: a subscriber that falls behind loses the oldest events, which is
//! acceptable for progress reporting.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::artifacts::catalog::ArtifactRef;
use crate::server::registry::ServerState;

/// Download state change event - single event stream for all download state
/// transitions of one artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DownloadStateChanged {
    /// Download is in progress. Emitted at a throttled rate, not every chunk.
    Progress {
        reference: ArtifactRef,
        #[serde(rename = "downloadedBytes")]
        downloaded_bytes: u64,
        #[serde(rename = "totalBytes")]
        total_bytes: u64,
        percent: f64,
    },
    /// Archive downloaded, extraction running.
    Extracting { reference: ArtifactRef },
    /// Artifact installed and ready to use.
    Installed { reference: ArtifactRef },
    /// Download or extraction failed.
    Failed {
        reference: ArtifactRef,
        error: String,
    },
}

/// Server lifecycle event - one stream for all instances. The `state` field
/// carries the state the instance just entered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStateChanged {
    pub pid: u32,
    pub port: u16,
    pub model: ArtifactRef,
    pub state: ServerState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RuntimeEvent {
    Download(DownloadStateChanged),
    Server(ServerStateChanged),
}

/// Process-local fan-out bus for [`RuntimeEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Send errors (no subscribers) are ignored.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_download(&self, event: DownloadStateChanged) {
        self.emit(RuntimeEvent::Download(event));
    }

    pub fn emit_server(&self, event: ServerStateChanged) {
        self.emit(RuntimeEvent::Server(event));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
