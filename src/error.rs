/// Errors surfaced by the runtime manager.
///
/// Download and extraction failures are retryable: the store guarantees no
/// partial install survives them, so the caller may simply invoke the same
/// operation again. Health-check timeouts and spawn failures are terminal for
/// that start attempt; the supervisor guarantees the OS process is gone.
/// Shutdown failures are logged and always followed by a forced kill, so they
/// never prevent an instance from reaching `Stopped`.
///
/// Variants carry owned strings rather than source errors so the enum stays
/// `Clone`: a download outcome is fanned out to every caller that joined the
/// same in-flight task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("download failed: {0}")]
    DownloadFailure(String),
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),
    #[error("checksum mismatch for {reference}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        reference: String,
        expected: String,
        actual: String,
    },
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),
    #[error("port allocation failed: {0}")]
    PortAllocationFailure(String),
    #[error("failed to spawn server process: {0}")]
    ProcessSpawnFailure(String),
    #[error("server did not become healthy within {attempts} attempts")]
    HealthCheckTimeout { attempts: u32 },
    #[error("graceful shutdown failed: {0}")]
    ShutdownFailure(String),
    #[error("artifact not found in catalog: {0}")]
    ArtifactNotFound(String),
    #[error("artifact {0} is in use by a running server")]
    ArtifactInUse(String),
    #[error("an instance is already running for {0}")]
    InstanceAlreadyRunning(String),
    #[error("no download location for platform {0}")]
    NoDownloadForPlatform(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e.to_string())
    }
}

impl RuntimeError {
    /// Whether the caller may retry the same operation and expect a clean
    /// starting point.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::DownloadFailure(_)
                | RuntimeError::ExtractionFailure(_)
                | RuntimeError::ChecksumMismatch { .. }
                | RuntimeError::PortAllocationFailure(_)
        )
    }
}
