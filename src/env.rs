//! Runtime environment: resolved paths and supervision tuning knobs.
//!
//! The settings file and all managed payloads live under one base directory.
//! Resolution order for the base directory:
//!   1. `--base-dir` CLI flag
//!   2. `COMFYCTL_BASE` environment variable
//!   3. `$XDG_DATA_HOME/comfyctl`
//!   4. `~/.local/share/comfyctl`

use directories::BaseDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upstream engine repository cloned by the installer.
pub const ENGINE_REPO: &str = "https://github.com/Comfy-Org/ComfyUI.git";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8188;

/// Multi-instance limits.
pub const MAX_INSTANCES: usize = 8;
pub const PORT_RANGE_START: u16 = 8188;
pub const PORT_RANGE_END: u16 = 8199;

/// Model subdirectories matching the engine's `models/` layout.
pub const MODEL_CATEGORIES: &[&str] = &[
    "checkpoints",
    "diffusion_models",
    "vae",
    "clip",
    "text_encoders",
    "loras",
    "controlnet",
    "gguf",
    "unet",
    "embeddings",
    "upscale_models",
    "clip_vision",
    "model_patches",
    "latent_upscale_models",
];

/// Resolve the base directory following the priority chain.
pub fn resolve_base(cli_base: Option<&Path>) -> PathBuf {
    // 1. CLI flag
    if let Some(base) = cli_base {
        return base.to_path_buf();
    }

    // 2. Environment variable
    if let Ok(base) = std::env::var("COMFYCTL_BASE") {
        if !base.is_empty() {
            return PathBuf::from(base);
        }
    }

    // 3. XDG_DATA_HOME
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("comfyctl");
        }
    }

    // 4. Default: ~/.local/share/comfyctl
    //    (On Windows use data_local_dir() as base)
    if let Some(base_dirs) = BaseDirs::new() {
        #[cfg(windows)]
        let base = base_dirs.data_local_dir().to_path_buf();
        #[cfg(not(windows))]
        let base = base_dirs.home_dir().join(".local").join("share");
        return base.join("comfyctl");
    }

    // Fallback if directories crate returns None
    PathBuf::from("~/.local/share/comfyctl")
}

/// The built-in engine checkout location for a given base directory.
pub fn builtin_engine_dir(base: &Path) -> PathBuf {
    base.join("comfyui")
}

/// Resolved paths and probe tuning for one control-plane process.
///
/// Constructed once at startup (and again when the active engine directory
/// is switched) and passed to every component; nothing reads ambient
/// module-level state.
#[derive(Debug, Clone)]
pub struct Environment {
    pub base_dir: PathBuf,
    /// Active engine checkout (built-in or an external install).
    pub engine_dir: PathBuf,
    /// Explicit interpreter, bypassing embedded/venv/system resolution.
    pub interpreter_override: Option<PathBuf>,
    /// Total wall-clock budget for the readiness probe.
    pub readiness_timeout: Duration,
    /// Pause between readiness probe attempts.
    pub probe_interval: Duration,
    /// Per-request timeout for one probe GET.
    pub probe_request_timeout: Duration,
}

impl Environment {
    pub fn new(base_dir: PathBuf, engine_dir: PathBuf) -> Self {
        Environment {
            base_dir,
            engine_dir,
            interpreter_override: None,
            readiness_timeout: Duration::from_secs(120),
            probe_interval: Duration::from_secs(1),
            probe_request_timeout: Duration::from_secs(2),
        }
    }

    pub fn builtin_engine_dir(&self) -> PathBuf {
        builtin_engine_dir(&self.base_dir)
    }

    /// True when the active engine directory is not the built-in checkout.
    pub fn is_external(&self) -> bool {
        self.engine_dir != self.builtin_engine_dir()
    }

    pub fn main_py(&self) -> PathBuf {
        self.engine_dir.join("main.py")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.engine_dir.join("models")
    }

    pub fn custom_nodes_dir(&self) -> PathBuf {
        self.engine_dir.join("custom_nodes")
    }

    pub fn python_embedded_dir(&self) -> PathBuf {
        self.base_dir.join("python_embedded")
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.base_dir.join("venv")
    }

    pub fn git_portable_dir(&self) -> PathBuf {
        self.base_dir.join("git_portable")
    }

    pub fn ffmpeg_portable_dir(&self) -> PathBuf {
        self.base_dir.join("ffmpeg_portable")
    }

    /// Interpreter used to launch the engine and run pip.
    ///
    /// Priority: explicit override > embedded > legacy venv > system
    /// (bare program name, resolved through `PATH` at spawn time).
    pub fn interpreter(&self) -> PathBuf {
        if let Some(exe) = &self.interpreter_override {
            return exe.clone();
        }
        let embedded = self.embedded_python();
        if embedded.exists() {
            return embedded;
        }
        let venv = self.venv_python();
        if venv.exists() {
            return venv;
        }
        #[cfg(windows)]
        return PathBuf::from("python");
        #[cfg(not(windows))]
        PathBuf::from("python3")
    }

    /// True when a managed (embedded or venv) interpreter is present.
    pub fn env_ready(&self) -> bool {
        self.interpreter_override.is_some()
            || self.embedded_python().exists()
            || self.venv_python().exists()
    }

    fn embedded_python(&self) -> PathBuf {
        #[cfg(windows)]
        return self.python_embedded_dir().join("python.exe");
        #[cfg(not(windows))]
        self.python_embedded_dir().join("bin").join("python3")
    }

    fn venv_python(&self) -> PathBuf {
        #[cfg(windows)]
        return self.venv_dir().join("Scripts").join("python.exe");
        #[cfg(not(windows))]
        self.venv_dir().join("bin").join("python3")
    }

    /// Git to use for clone/pull. Portable payload preferred, system fallback.
    pub fn git_program(&self) -> PathBuf {
        let portable = self.git_portable_bin().join(git_exe_name());
        if portable.exists() {
            return portable;
        }
        PathBuf::from("git")
    }

    fn git_portable_bin(&self) -> PathBuf {
        #[cfg(windows)]
        return self.git_portable_dir().join("cmd");
        #[cfg(not(windows))]
        self.git_portable_dir().join("bin")
    }

    /// Directories prepended to the engine child's `PATH` so custom nodes
    /// can find the portable git and ffmpeg.
    pub fn path_prepend(&self) -> Vec<PathBuf> {
        let mut additions = Vec::new();
        let git_bin = self.git_portable_bin();
        if git_bin.exists() {
            additions.push(git_bin);
        }
        let ffmpeg_bin = self.ffmpeg_portable_dir().join("bin");
        if ffmpeg_bin.exists() {
            additions.push(ffmpeg_bin);
        }
        additions
    }
}

fn git_exe_name() -> &'static str {
    if cfg!(windows) { "git.exe" } else { "git" }
}

// ---------- Unit tests ----------
