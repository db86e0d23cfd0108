use std::path::{Path, PathBuf};
use std::str::FromStr;

use strum::{Display, EnumString};

use crate::error::RuntimeError;

/// Inference backends this runtime knows how to launch and parse.
///
/// The string forms double as catalog model ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Backend {
    SpeciesNet,
    DeepFaune,
    Manas,
}

impl Backend {
    /// Dispatch on a catalog model id. Unknown ids fail fast.
    pub fn for_model_id(id: &str) -> Result<Self, RuntimeError> {
        Backend::from_str(id).map_err(|_| RuntimeError::UnsupportedBackend(id.to_string()))
    }

    /// Server entry-point script inside the runtime bundle.
    pub fn entry_point(&self) -> &'static str {
        match self {
            Backend::SpeciesNet => "run_speciesnet_server.py",
            Backend::DeepFaune => "run_deepfaune_server.py",
            Backend::Manas => "run_manas_server.py",
        }
    }

    /// Whether the backend reports detections in center-normalized `xywhn`
    /// form (YOLO) rather than top-left `bbox` form.
    pub fn emits_center_format(&self) -> bool {
        matches!(self, Backend::DeepFaune | Backend::Manas)
    }
}

/// Everything the supervisor needs to spawn a server process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory; the server scripts import siblings relative to it.
    pub cwd: PathBuf,
}

/// Path to the bundled Python interpreter inside a runtime install.
pub fn interpreter_path(runtime_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        runtime_dir.join("python.exe")
    } else {
        runtime_dir.join("bin").join("python3")
    }
}

/// Build the launch command for a backend.
///
/// Flag names follow the server scripts: every server takes `--port` and a
/// request `--timeout`; weight filepaths are passed explicitly where the
/// script requires them.
pub fn launch_spec(
    backend: Backend,
    runtime_dir: &Path,
    model_dir: &Path,
    port: u16,
    request_timeout_secs: u64,
) -> LaunchSpec {
    let mut args = vec![
        runtime_dir.join(backend.entry_point()).display().to_string(),
        "--port".into(),
        port.to_string(),
        "--timeout".into(),
        request_timeout_secs.to_string(),
    ];

    let weights = model_dir.join("weights");
    match backend {
        Backend::SpeciesNet => {
            // SpeciesNet resolves its ensemble from a single model folder.
            args.push("--model-folder".into());
            args.push(model_dir.display().to_string());
        }
        Backend::DeepFaune => {
            args.push("--filepath-detector-weights".into());
            args.push(weights.join("deepfaune-yolov8s.pt").display().to_string());
            args.push("--filepath-classifier-weights".into());
            args.push(
                weights
                    .join("deepfaune-vit_large_patch14_dinov2.pt")
                    .display()
                    .to_string(),
            );
        }
        Backend::Manas => {
            args.push("--filepath-detector-weights".into());
            args.push(weights.join("MDV6-yolov10x.pt").display().to_string());
            args.push("--filepath-classifier-weights".into());
            args.push(weights.join("classifier.pt").display().to_string());
            args.push("--filepath-classes".into());
            args.push(weights.join("classes.pickle").display().to_string());
        }
    }

    LaunchSpec {
        program: interpreter_path(runtime_dir),
        args,
        cwd: runtime_dir.to_path_buf(),
    }
}
