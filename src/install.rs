//! Engine installation: clone, requirements, update, purge.
//!
//! All operations run on worker threads and report through a progress sink;
//! tool invocations (git, pip) go through the environment-resolved programs
//! so portable payloads win over system installs.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::info;

use crate::env::{Environment, ENGINE_REPO, MODEL_CATEGORIES};
use crate::process::ProgressSink;

/// Marker written after a successful requirements install.
const REQUIREMENTS_MARKER: &str = ".requirements_installed";

#[derive(Debug, Clone, Serialize)]
pub struct InstallationStatus {
    pub env_ready: bool,
    pub engine_installed: bool,
    pub requirements_installed: bool,
    pub models_dir_exists: bool,
}

pub struct Installer {
    env: Arc<Environment>,
}

impl Installer {
    pub fn new(env: Arc<Environment>) -> Self {
        Installer { env }
    }

    pub fn is_installed(&self) -> bool {
        self.env.main_py().exists()
    }

    pub fn is_external(&self) -> bool {
        self.env.is_external()
    }

    pub fn check_installation(&self) -> InstallationStatus {
        InstallationStatus {
            env_ready: self.env.env_ready(),
            engine_installed: self.is_installed(),
            requirements_installed: self.env.engine_dir.join(REQUIREMENTS_MARKER).exists(),
            models_dir_exists: self.env.models_dir().exists(),
        }
    }

    /// Clone the engine, install its requirements, create model folders.
    /// Models parked by an earlier purge are moved back into the fresh
    /// checkout.
    pub fn full_install(&self, progress: &ProgressSink) -> Result<()> {
        if self.is_external() {
            // External checkouts are managed by the user; only the
            // requirements and model folders are touched.
            progress(0, 3, "Using external ComfyUI checkout");
        } else {
            progress(0, 3, "Cloning ComfyUI...");
            self.clone_engine()?;
            self.restore_models()?;
        }

        progress(1, 3, "Installing requirements...");
        self.install_requirements()?;

        progress(2, 3, "Creating model directories...");
        self.create_model_directories()?;

        progress(3, 3, "Installation complete");
        Ok(())
    }

    /// Pull the latest engine revision and refresh requirements.
    pub fn update(&self, progress: &ProgressSink) -> Result<()> {
        if !self.is_installed() {
            bail!("ComfyUI not installed");
        }

        progress(0, 2, "Pulling latest ComfyUI...");
        let mut cmd = Command::new(self.env.git_program());
        cmd.arg("-C").arg(&self.env.engine_dir).arg("pull");
        run_tool(cmd, "git pull")?;

        progress(1, 2, "Installing requirements...");
        self.install_requirements()?;

        progress(2, 2, "Update complete");
        Ok(())
    }

    /// Install the optional SageAttention accelerator into the managed
    /// interpreter.
    pub fn install_sage_attention(&self, progress: &ProgressSink) -> Result<()> {
        progress(0, 1, "Installing Triton + SageAttention...");
        let mut cmd = Command::new(self.env.interpreter());
        cmd.args(["-m", "pip", "install", "triton", "sageattention"]);
        run_tool(cmd, "pip install sageattention")?;
        progress(1, 1, "SageAttention installed");
        Ok(())
    }

    /// Delete the engine checkout but keep the models and the interpreter
    /// environment. Models are parked next to the checkout so the engine
    /// directory ends up empty for the next `git clone`; `full_install`
    /// moves them back. Callers stop all instances first.
    pub fn purge(&self, progress: &ProgressSink) -> Result<()> {
        if self.is_external() {
            bail!("Refusing to purge an external ComfyUI checkout");
        }
        if !self.env.engine_dir.exists() {
            progress(2, 2, "Nothing to purge");
            return Ok(());
        }

        let models = self.env.models_dir();
        if models.exists() {
            progress(0, 2, "Preserving models...");
            merge_move(&models, &self.models_backup_dir())?;
        }

        progress(1, 2, "Removing ComfyUI...");
        std::fs::remove_dir_all(&self.env.engine_dir)
            .with_context(|| format!("remove {}", self.env.engine_dir.display()))?;

        info!(dir = %self.env.engine_dir.display(), "engine purged, models parked");
        progress(2, 2, "Purge complete (models preserved)");
        Ok(())
    }

    /// Delete everything this tool manages: the built-in engine checkout
    /// (models included) and the portable interpreter/git/ffmpeg payloads.
    /// An external active checkout is left alone.
    pub fn purge_all(&self, progress: &ProgressSink) -> Result<()> {
        progress(0, 1, "Purging ComfyUI, models, and environment...");

        let targets = [
            self.env.builtin_engine_dir(),
            self.models_backup_dir(),
            self.env.python_embedded_dir(),
            self.env.venv_dir(),
            self.env.git_portable_dir(),
            self.env.ffmpeg_portable_dir(),
        ];
        for dir in targets {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("remove {}", dir.display()))?;
            }
        }

        info!("full purge complete");
        progress(1, 1, "Full purge complete");
        Ok(())
    }

    fn clone_engine(&self) -> Result<()> {
        if self.is_installed() {
            return Ok(());
        }
        if let Some(parent) = self.env.engine_dir.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut cmd = Command::new(self.env.git_program());
        cmd.arg("clone").arg(ENGINE_REPO).arg(&self.env.engine_dir);
        run_tool(cmd, "git clone")
    }

    /// Where purge parks the models tree while the checkout is gone.
    fn models_backup_dir(&self) -> std::path::PathBuf {
        self.env.base_dir.join("_models_backup")
    }

    /// Move parked models back into the checkout's models directory. The
    /// fresh clone ships placeholder category folders, so this merges
    /// rather than renaming wholesale.
    fn restore_models(&self) -> Result<()> {
        let backup = self.models_backup_dir();
        if !backup.exists() {
            return Ok(());
        }
        merge_move(&backup, &self.env.models_dir())
    }

    fn install_requirements(&self) -> Result<()> {
        let requirements = self.env.engine_dir.join("requirements.txt");
        if !requirements.exists() {
            bail!("requirements.txt not found in {}", self.env.engine_dir.display());
        }
        let mut cmd = Command::new(self.env.interpreter());
        cmd.args(["-m", "pip", "install", "-r"])
            .arg(&requirements)
            .current_dir(&self.env.engine_dir);
        run_tool(cmd, "pip install requirements")?;

        std::fs::write(self.env.engine_dir.join(REQUIREMENTS_MARKER), b"ok\n")
            .context("write requirements marker")?;
        Ok(())
    }

    fn create_model_directories(&self) -> Result<()> {
        let models = self.env.models_dir();
        for category in MODEL_CATEGORIES {
            std::fs::create_dir_all(models.join(category))
                .with_context(|| format!("create model dir {category}"))?;
        }
        Ok(())
    }
}

/// Move `src` into `dest`, merging directory contents where `dest` already
/// has the same entry. When both sides hold a file of the same name the
/// destination wins and the source copy is left behind in `src`.
fn merge_move(src: &std::path::Path, dest: &std::path::Path) -> Result<()> {
    if !dest.exists() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        return std::fs::rename(src, dest)
            .with_context(|| format!("move {} to {}", src.display(), dest.display()));
    }
    if src.is_dir() && dest.is_dir() {
        for entry in std::fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
            let entry = entry?;
            merge_move(&entry.path(), &dest.join(entry.file_name()))?;
        }
        // Gone only if everything moved out.
        let _ = std::fs::remove_dir(src);
    }
    Ok(())
}

/// Run an external tool to completion; a non-zero exit becomes an error
/// carrying the tool's stderr.
pub(crate) fn run_tool(mut cmd: Command, what: &str) -> Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("spawn {what}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed: {}", stderr.trim());
    }
    Ok(())
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env;
    use crate::process::noop_progress;

    fn fake_install() -> (tempfile::TempDir, Installer) {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        let engine = env::builtin_engine_dir(&base);
        std::fs::create_dir_all(engine.join("models").join("checkpoints")).unwrap();
        std::fs::create_dir_all(engine.join("comfy")).unwrap();
        std::fs::write(engine.join("main.py"), "print('engine')\n").unwrap();
        std::fs::write(engine.join(REQUIREMENTS_MARKER), "ok\n").unwrap();
        let installer = Installer::new(Arc::new(Environment::new(base, engine)));
        (tmp, installer)
    }

    #[test]
    fn check_installation_reflects_disk_state() {
        let (_tmp, installer) = fake_install();
        let status = installer.check_installation();
        assert!(status.engine_installed);
        assert!(status.requirements_installed);
        assert!(status.models_dir_exists);
        assert!(!status.env_ready);
    }

    #[test]
    fn check_installation_on_empty_base() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        let engine = env::builtin_engine_dir(&base);
        let installer = Installer::new(Arc::new(Environment::new(base, engine)));
        let status = installer.check_installation();
        assert!(!status.engine_installed);
        assert!(!status.requirements_installed);
        assert!(!status.models_dir_exists);
    }

    #[test]
    fn purge_parks_models_and_empties_the_checkout() {
        let (_tmp, installer) = fake_install();
        let engine = installer.env.engine_dir.clone();
        std::fs::write(
            engine.join("models").join("checkpoints").join("a.safetensors"),
            b"weights",
        )
        .unwrap();

        installer.purge(&noop_progress()).unwrap();

        // The checkout is gone entirely, so the next `git clone` sees a
        // fresh destination; the models tree is parked beside it.
        assert!(!engine.exists());
        assert!(!installer.is_installed());
        let parked = installer.models_backup_dir();
        assert!(parked.join("checkpoints").join("a.safetensors").exists());
    }

    #[test]
    fn reinstall_after_purge_restores_models() {
        let (_tmp, installer) = fake_install();
        let engine = installer.env.engine_dir.clone();
        std::fs::write(
            engine.join("models").join("checkpoints").join("a.safetensors"),
            b"weights",
        )
        .unwrap();

        installer.purge(&noop_progress()).unwrap();

        // Stand in for a fresh clone: main.py plus the repo's placeholder
        // category folders, one of which collides with the parked tree.
        std::fs::create_dir_all(engine.join("models").join("checkpoints")).unwrap();
        std::fs::create_dir_all(engine.join("models").join("vae")).unwrap();
        std::fs::write(engine.join("main.py"), "print('engine')\n").unwrap();

        installer.restore_models().unwrap();

        assert!(
            engine
                .join("models")
                .join("checkpoints")
                .join("a.safetensors")
                .exists()
        );
        assert!(engine.join("models").join("vae").exists());
        assert!(!installer.models_backup_dir().exists());
    }

    #[test]
    fn repeated_purges_accumulate_parked_models() {
        let (_tmp, installer) = fake_install();
        let engine = installer.env.engine_dir.clone();
        std::fs::write(
            engine.join("models").join("checkpoints").join("a.safetensors"),
            b"a",
        )
        .unwrap();
        installer.purge(&noop_progress()).unwrap();

        // Second install cycle with a different model, purged again before
        // any restore ran.
        std::fs::create_dir_all(engine.join("models").join("checkpoints")).unwrap();
        std::fs::write(engine.join("main.py"), "x\n").unwrap();
        std::fs::write(
            engine.join("models").join("checkpoints").join("b.safetensors"),
            b"b",
        )
        .unwrap();
        installer.purge(&noop_progress()).unwrap();

        let parked = installer.models_backup_dir().join("checkpoints");
        assert!(parked.join("a.safetensors").exists());
        assert!(parked.join("b.safetensors").exists());
    }

    #[test]
    fn purge_refuses_external_checkout() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        let external = tmp.path().join("external-comfy");
        std::fs::create_dir_all(&external).unwrap();
        std::fs::write(external.join("main.py"), "x\n").unwrap();

        let installer = Installer::new(Arc::new(Environment::new(base, external.clone())));
        assert!(installer.is_external());
        assert!(installer.purge(&noop_progress()).is_err());
        assert!(external.join("main.py").exists());
    }

    #[test]
    fn purge_all_removes_managed_payloads_only() {
        let (_tmp, installer) = fake_install();
        let base = &installer.env.base_dir;
        std::fs::create_dir_all(base.join("python_embedded")).unwrap();
        std::fs::create_dir_all(base.join("git_portable")).unwrap();
        std::fs::create_dir_all(base.join("_models_backup")).unwrap();
        let keep = base.join("settings.json");
        std::fs::write(&keep, b"{}").unwrap();

        installer.purge_all(&noop_progress()).unwrap();

        assert!(!installer.env.builtin_engine_dir().exists());
        assert!(!base.join("python_embedded").exists());
        assert!(!base.join("git_portable").exists());
        assert!(!base.join("_models_backup").exists());
        assert!(keep.exists());
    }

    #[test]
    fn update_requires_an_install() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        let engine = env::builtin_engine_dir(&base);
        let installer = Installer::new(Arc::new(Environment::new(base, engine)));
        assert!(installer.update(&noop_progress()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn run_tool_surfaces_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 2"]);
        let err = run_tool(cmd, "sh").unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");

        let mut ok = Command::new("sh");
        ok.args(["-c", "exit 0"]);
        assert!(run_tool(ok, "sh").is_ok());
    }
}
