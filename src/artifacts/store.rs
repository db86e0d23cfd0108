use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::artifacts::catalog::{ArtifactKind, ArtifactRef, CatalogEntry, Platform};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::events::{DownloadStateChanged, EventBus};
use crate::server::registry::ServerRegistry;

/// Outcome shared with every caller that joined an in-flight download.
type TaskOutcome = Option<Result<(), RuntimeError>>;

struct ActiveTask {
    cancel: CancellationToken,
    outcome: watch::Receiver<TaskOutcome>,
}

/// What a caller resolved to while holding the task-table lock: wait on the
/// task another caller is driving, or drive the install itself.
enum TaskRole {
    Join(watch::Receiver<TaskOutcome>),
    Own(watch::Sender<TaskOutcome>, CancellationToken),
}

/// Manages artifact downloads, extraction and on-disk layout.
///
/// Installed state is never persisted separately: an artifact is installed
/// iff its install directory exists and is non-empty. `is_installed` wraps
/// that check so a cached manifest could be added later without touching
/// call sites.
///
/// Layout under the root data directory:
/// `<root>/<kind>/<id>/<version>/...` for installs and
/// `<root>/<kind>/archives/<id>/<version>.tar.gz` for in-flight archives.
pub struct ArtifactStore {
    root: PathBuf,
    client: reqwest::Client,
    events: EventBus,
    progress_throttle: Duration,
    /// In-memory table of active downloads; at most one per reference.
    /// Concurrent requests for the same reference join the existing task.
    tasks: Mutex<HashMap<ArtifactRef, ActiveTask>>,
}

impl ArtifactStore {
    pub fn new(config: &RuntimeConfig, events: EventBus) -> Self {
        Self {
            root: config.data_dir.clone(),
            client: reqwest::Client::new(),
            events,
            progress_throttle: config.progress_throttle,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory an artifact is (or would be) installed into. Pure, no I/O.
    pub fn install_dir(&self, reference: &ArtifactRef) -> PathBuf {
        self.root
            .join(reference.kind.dir_name())
            .join(&reference.id)
            .join(&reference.version)
    }

    /// Where an artifact's archive is staged while downloading. Pure, no I/O.
    pub fn archive_path(&self, reference: &ArtifactRef) -> PathBuf {
        self.root
            .join(reference.kind.dir_name())
            .join("archives")
            .join(&reference.id)
            .join(format!("{}.tar.gz", reference.version))
    }

    /// True iff the install directory exists and contains at least one entry.
    /// Presence on disk is the source of truth for installed state.
    pub fn is_installed(&self, reference: &ArtifactRef) -> bool {
        dir_non_empty(&self.install_dir(reference))
    }

    /// Walk the on-disk layout and return every installed reference.
    pub fn list_installed(&self) -> Vec<ArtifactRef> {
        let mut installed = Vec::new();
        for kind in [ArtifactKind::Model, ArtifactKind::Runtime] {
            let kind_dir = self.root.join(kind.dir_name());
            for id_entry in read_dir_or_empty(&kind_dir) {
                let id = id_entry.file_name().to_string_lossy().to_string();
                // Archives are staged under the same kind directory.
                if id == "archives" || !id_entry.path().is_dir() {
                    continue;
                }
                for version_entry in read_dir_or_empty(&id_entry.path()) {
                    if !version_entry.path().is_dir() {
                        continue;
                    }
                    let version = version_entry.file_name().to_string_lossy().to_string();
                    let reference = ArtifactRef {
                        kind,
                        id: id.clone(),
                        version,
                    };
                    if self.is_installed(&reference) {
                        installed.push(reference);
                    }
                }
            }
        }
        installed.sort();
        installed
    }

    /// Download and install an artifact if it is not installed already.
    ///
    /// Idempotent: returns immediately when the install directory is already
    /// populated. If a download for the same reference is in flight, joins it
    /// and returns its outcome instead of starting a second one. Any failure
    /// leaves neither a partial install directory nor a stale archive behind.
    pub async fn ensure_installed(
        &self,
        entry: &CatalogEntry,
        platform: Platform,
    ) -> Result<(), RuntimeError> {
        let reference = entry.reference.clone();

        if self.is_installed(&reference) {
            debug!("Artifact {} already installed", reference);
            return Ok(());
        }

        // Join an active task for this reference, or claim it. The map is
        // only touched synchronously under the lock so two callers can never
        // both claim the same reference. The lock scope closes before any
        // await so the returned future stays `Send`.
        let role = {
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.get(&reference) {
                Some(task) => TaskRole::Join(task.outcome.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let cancel = CancellationToken::new();
                    tasks.insert(
                        reference.clone(),
                        ActiveTask {
                            cancel: cancel.clone(),
                            outcome: rx,
                        },
                    );
                    TaskRole::Own(tx, cancel)
                }
            }
        };

        let (outcome_tx, cancel) = match role {
            TaskRole::Join(rx) => {
                info!("Joining in-flight download of {}", reference);
                return wait_for_outcome(rx).await;
            }
            TaskRole::Own(tx, cancel) => (tx, cancel),
        };

        info!("Starting download of {}", reference);
        let result = self.run_install(entry, platform, &cancel).await;

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.remove(&reference);
        }

        match &result {
            Ok(()) => {
                info!("Artifact {} installed", reference);
                self.events.emit_download(DownloadStateChanged::Installed {
                    reference: reference.clone(),
                });
            }
            Err(e) => {
                warn!("Install of {} failed: {}", reference, e);
                self.events.emit_download(DownloadStateChanged::Failed {
                    reference: reference.clone(),
                    error: e.to_string(),
                });
            }
        }

        let _ = outcome_tx.send(Some(result.clone()));
        result
    }

    /// Cancel an in-flight download. Returns false when no download for the
    /// reference is active.
    pub fn cancel_download(&self, reference: &ArtifactRef) -> bool {
        let tasks = self.tasks.lock().unwrap();
        match tasks.get(reference) {
            Some(task) => {
                task.cancel.cancel();
                info!("Cancellation requested for download of {}", reference);
                true
            }
            None => false,
        }
    }

    /// Delete an artifact's archive and install directory.
    ///
    /// Refuses while any non-stopped server instance references the artifact:
    /// removing files out from under a running process is undefined behavior
    /// for that process, and the caller must stop it first.
    pub fn remove(
        &self,
        reference: &ArtifactRef,
        registry: &ServerRegistry,
    ) -> Result<(), RuntimeError> {
        if registry.is_artifact_in_use(reference) {
            return Err(RuntimeError::ArtifactInUse(reference.to_string()));
        }

        let archive = self.archive_path(reference);
        if archive.exists() {
            std::fs::remove_file(&archive)?;
            debug!("Deleted archive {:?}", archive);
        }

        let install = self.install_dir(reference);
        if install.exists() {
            std::fs::remove_dir_all(&install)?;
            info!("Deleted install {:?}", install);
        }

        Ok(())
    }

    /// Remove installed artifacts that are no longer in the live catalog
    /// (superseded versions, retired entries). Artifacts referenced by a
    /// running server are skipped, never removed. Returns the removed refs.
    pub fn garbage_collect(
        &self,
        live_refs: &[ArtifactRef],
        registry: &ServerRegistry,
    ) -> Vec<ArtifactRef> {
        let mut removed = Vec::new();
        for reference in self.list_installed() {
            if live_refs.contains(&reference) {
                continue;
            }
            if registry.is_artifact_in_use(&reference) {
                warn!(
                    "Skipping garbage collection of {}: a server is using it",
                    reference
                );
                continue;
            }
            match self.remove(&reference, registry) {
                Ok(()) => {
                    info!("Garbage collected stale artifact {}", reference);
                    removed.push(reference);
                }
                Err(e) => warn!("Failed to garbage collect {}: {}", reference, e),
            }
        }
        removed
    }

    /// Remove the entire artifact root (all kinds, archives included).
    ///
    /// Destructive full reset. Callers must stop all server instances first;
    /// this is a documented precondition, not enforced here.
    pub fn clear_all(&self) -> Result<(), RuntimeError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
            info!("Cleared artifact root {:?}", self.root);
        }
        Ok(())
    }

    /// The download-then-extract-then-install sequence for one reference.
    /// Strictly sequential within the reference; suspension points let
    /// unrelated work interleave.
    async fn run_install(
        &self,
        entry: &CatalogEntry,
        platform: Platform,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let reference = &entry.reference;
        let url = entry.download.url_for(platform).ok_or_else(|| {
            RuntimeError::NoDownloadForPlatform(format!("{platform:?} for {reference}"))
        })?;

        let archive = self.archive_path(reference);
        if let Some(parent) = archive.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = self.download_archive(entry, url, &archive, cancel).await {
            // Leave no orphaned disk usage behind; the next attempt
            // re-downloads from scratch.
            let _ = tokio::fs::remove_file(&archive).await;
            return Err(e);
        }

        if let Some(expected) = &entry.sha256 {
            if let Err(e) = verify_checksum(&archive, expected, reference).await {
                let _ = tokio::fs::remove_file(&archive).await;
                return Err(e);
            }
        }

        // A concurrent retry may have completed extraction already; the
        // directory check keeps this step idempotent.
        if self.is_installed(reference) {
            let _ = tokio::fs::remove_file(&archive).await;
            return Ok(());
        }

        self.events.emit_download(DownloadStateChanged::Extracting {
            reference: reference.clone(),
        });

        let result = self.extract_archive(&archive, reference).await;

        // The archive is deleted in every case: on success it is no longer
        // needed, on failure it may be corrupt and must be re-downloaded.
        let _ = tokio::fs::remove_file(&archive).await;
        result
    }

    /// Stream the archive to disk, emitting throttled progress events.
    async fn download_archive(
        &self,
        entry: &CatalogEntry,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let reference = &entry.reference;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RuntimeError::DownloadFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RuntimeError::DownloadFailure(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let total_bytes = response
            .content_length()
            .unwrap_or(entry.declared_size_mib * 1024 * 1024);

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest)
            .await?;
        let mut file = tokio::io::BufWriter::new(file);

        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        let mut last_emit = Instant::now();

        while let Some(chunk_result) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(RuntimeError::DownloadFailure(format!(
                    "download of {reference} cancelled"
                )));
            }

            let chunk = chunk_result.map_err(|e| RuntimeError::DownloadFailure(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            // Throttled so the event stream is not flooded on fast links.
            if last_emit.elapsed() >= self.progress_throttle {
                self.emit_progress(reference, downloaded, total_bytes);
                last_emit = Instant::now();
            }
        }

        file.flush().await?;
        self.emit_progress(reference, downloaded, total_bytes.max(downloaded));
        Ok(())
    }

    fn emit_progress(&self, reference: &ArtifactRef, downloaded: u64, total: u64) {
        let percent = if total > 0 {
            (downloaded as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        debug!(
            "Download progress for {}: {:.1}% ({}/{} bytes)",
            reference, percent, downloaded, total
        );
        self.events.emit_download(DownloadStateChanged::Progress {
            reference: reference.clone(),
            downloaded_bytes: downloaded,
            total_bytes: total,
            percent,
        });
    }

    /// Extract the archive into the install directory's parent. Archives
    /// contain a single `<version>/` top-level directory, so extraction
    /// produces the install directory itself.
    async fn extract_archive(
        &self,
        archive: &Path,
        reference: &ArtifactRef,
    ) -> Result<(), RuntimeError> {
        let install = self.install_dir(reference);
        let parent = install
            .parent()
            .ok_or_else(|| RuntimeError::ExtractionFailure("install dir has no parent".into()))?;
        tokio::fs::create_dir_all(parent).await?;

        let output = tokio::process::Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(parent)
            .output()
            .await
            .map_err(|e| RuntimeError::ExtractionFailure(format!("failed to run tar: {e}")))?;

        if !output.status.success() {
            // Do not leave a partially extracted install behind.
            let _ = tokio::fs::remove_dir_all(&install).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::ExtractionFailure(format!(
                "tar exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if !self.is_installed(reference) {
            let _ = tokio::fs::remove_dir_all(&install).await;
            return Err(RuntimeError::ExtractionFailure(format!(
                "archive did not produce {}/",
                reference.version
            )));
        }

        Ok(())
    }
}

async fn wait_for_outcome(
    mut rx: watch::Receiver<TaskOutcome>,
) -> Result<(), RuntimeError> {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            // The driving task dropped the channel without publishing an
            // outcome; treat it as a failed download.
            return Err(RuntimeError::DownloadFailure(
                "download task ended without an outcome".into(),
            ));
        }
    }
}

/// SHA-256 verification of a downloaded archive against the catalog.
async fn verify_checksum(
    path: &Path,
    expected: &str,
    reference: &ArtifactRef,
) -> Result<(), RuntimeError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let actual = format!("{:x}", hasher.finalize());
    if actual != expected {
        return Err(RuntimeError::ChecksumMismatch {
            reference: reference.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn dir_non_empty(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

fn read_dir_or_empty(path: &Path) -> Vec<std::fs::DirEntry> {
    match std::fs::read_dir(path) {
        Ok(entries) => entries.filter_map(Result::ok).collect(),
        Err(_) => Vec::new(),
    }
}
