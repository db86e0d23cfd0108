pub mod catalog;
pub mod store;

pub use catalog::{ArtifactKind, ArtifactRef, CatalogEntry, DownloadLocation, Platform};
pub use store::ArtifactStore;
