use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of installable unit an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Model weights (plus any per-model assets the server script needs).
    Model,
    /// A self-contained Python environment bundling the interpreter and the
    /// server scripts a model runs under.
    Runtime,
}

impl ArtifactKind {
    /// Directory segment under the artifact root (`models/`, `runtimes/`).
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Model => "models",
            ArtifactKind::Runtime => "runtimes",
        }
    }
}

/// Immutable identity of an installable artifact. Everything else in the
/// store and registry is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub id: String,
    pub version: String,
}

impl ArtifactRef {
    pub fn model(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Model,
            id: id.into(),
            version: version.into(),
        }
    }

    pub fn runtime(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Runtime,
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// OS family the host is running on, supplied by the caller so the catalog
/// can pick the right download location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    MacosArm64,
    MacosX64,
    LinuxX64,
    WindowsX64,
}

/// Where an artifact's archive can be downloaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum DownloadLocation {
    /// One archive for every platform (model weights).
    Universal(String),
    /// Platform-specific archives (runtime bundles embed an interpreter).
    PerPlatform(BTreeMap<Platform, String>),
}

impl DownloadLocation {
    /// URL for the given platform, if one is declared.
    pub fn url_for(&self, platform: Platform) -> Option<&str> {
        match self {
            DownloadLocation::Universal(url) => Some(url),
            DownloadLocation::PerPlatform(map) => map.get(&platform).map(String::as_str),
        }
    }
}

/// Static information about an installable artifact.
/// This is hardcoded and never changes at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub reference: ArtifactRef,
    /// Human-readable name (e.g. "SpeciesNet").
    pub display_name: String,
    pub description: String,
    /// Approximate size of the extracted install in MiB.
    pub declared_size_mib: u64,
    pub download: DownloadLocation,
    /// The runtime bundle a model runs under. Models reference exactly one
    /// runtime; runtime entries have no dependency.
    pub runtime_dependency: Option<ArtifactRef>,
    /// SHA-256 of the archive (hex), verified after download when present.
    pub sha256: Option<String>,
}

const HF_BASE: &str = "https://huggingface.co/earthtoolsmaker";

fn model_url(repo: &str, version: &str) -> DownloadLocation {
    DownloadLocation::Universal(format!("{HF_BASE}/{repo}/resolve/main/{version}.tar.gz"))
}

/// Hardcoded catalog of installable artifacts. Model archives come from the
/// EarthToolsMaker HuggingFace repositories; the runtime bundle ships one
/// tarball per platform because it embeds a Python interpreter.
pub fn get_catalog() -> Vec<CatalogEntry> {
    let runtime_ref = ArtifactRef::runtime("python-common", "2025.1");

    let runtime_urls: BTreeMap<Platform, String> = [
        (Platform::MacosArm64, "common-macos-arm64"),
        (Platform::MacosX64, "common-macos-x64"),
        (Platform::LinuxX64, "common-linux-x64"),
        (Platform::WindowsX64, "common-windows-x64"),
    ]
    .into_iter()
    .map(|(p, name)| {
        (
            p,
            format!("{HF_BASE}/python-environments/resolve/main/2025.1/{name}.tar.gz"),
        )
    })
    .collect();

    vec![
        CatalogEntry {
            reference: runtime_ref.clone(),
            display_name: "Python environment".into(),
            description: "Bundled Python interpreter with the inference server scripts \
                          shared by all models."
                .into(),
            declared_size_mib: 3400,
            download: DownloadLocation::PerPlatform(runtime_urls),
            runtime_dependency: None,
            sha256: None,
        },
        CatalogEntry {
            reference: ArtifactRef::model("speciesnet", "4.0.1a"),
            display_name: "SpeciesNet".into(),
            description: "Google SpeciesNet ensemble: MegaDetector detections plus a \
                          global species classifier (~2000 labels)."
                .into(),
            declared_size_mib: 468,
            download: model_url("speciesnet", "4.0.1a"),
            runtime_dependency: Some(runtime_ref.clone()),
            sha256: None,
        },
        CatalogEntry {
            reference: ArtifactRef::model("deepfaune", "1.3"),
            display_name: "DeepFaune".into(),
            description: "CNRS DeepFaune classifier for European fauna, with a YOLO \
                          detector stage."
                .into(),
            declared_size_mib: 1320,
            download: model_url("deepfaune", "1.3"),
            runtime_dependency: Some(runtime_ref.clone()),
            sha256: None,
        },
        CatalogEntry {
            reference: ArtifactRef::model("manas", "1.0"),
            display_name: "Manas".into(),
            description: "OSI-Panthera classifier for Kyrgyz fauna (snow leopard focus), \
                          with a MegaDetector v6 detector stage."
                .into(),
            declared_size_mib: 412,
            download: model_url("manas", "1.0"),
            runtime_dependency: Some(runtime_ref),
            sha256: None,
        },
    ]
}

/// Look up a catalog entry by reference.
pub fn find_entry(reference: &ArtifactRef) -> Option<CatalogEntry> {
    get_catalog().into_iter().find(|e| &e.reference == reference)
}

/// Look up a model entry by id, taking the catalog's (single) version.
pub fn find_model(id: &str) -> Option<CatalogEntry> {
    get_catalog()
        .into_iter()
        .find(|e| e.reference.kind == ArtifactKind::Model && e.reference.id == id)
}

/// All references currently in the catalog. Artifacts installed on disk but
/// absent from this set are stale and eligible for garbage collection.
pub fn catalog_refs() -> Vec<ArtifactRef> {
    get_catalog().into_iter().map(|e| e.reference).collect()
}
