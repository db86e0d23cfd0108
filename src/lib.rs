//! Local inference runtime manager for the camera-trap desktop host.
//!
//! Installs model weights and the bundled Python environments they run
//! under, supervises the per-model inference server processes (spawn,
//! readiness probing, graceful/forced shutdown), and normalizes the
//! heterogeneous detection formats the backends report into one canonical
//! bounding-box representation.
//!
//! [`RuntimeManager`] is the entry point for hosts; the underlying pieces
//! ([`ArtifactStore`], [`ProcessSupervisor`], [`ServerRegistry`]) are public
//! for callers that need finer-grained control or isolated instances in
//! tests.

pub mod artifacts;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod manager;
pub mod server;

pub use artifacts::catalog::{
    catalog_refs, find_entry, find_model, get_catalog, ArtifactKind, ArtifactRef, CatalogEntry,
    DownloadLocation, Platform,
};
pub use artifacts::store::ArtifactStore;
pub use config::{PortPolicy, RuntimeConfig};
pub use detection::{detect_backend, to_canonical_bbox, CanonicalBbox};
pub use error::RuntimeError;
pub use events::{DownloadStateChanged, EventBus, RuntimeEvent, ServerStateChanged};
pub use manager::RuntimeManager;
pub use server::backend::{Backend, LaunchSpec};
pub use server::registry::{ServerInstance, ServerRegistry, ServerState};
pub use server::supervisor::ProcessSupervisor;
