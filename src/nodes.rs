//! Custom node ("plug-in") registry and lifecycle via the managed git.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::warn;

use crate::env::Environment;
use crate::install::run_tool;
use crate::process::ProgressSink;

/// One curated registry node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub category: &'static str,
    pub repo: &'static str,
    pub required: bool,
    pub description: &'static str,
}

pub static CUSTOM_NODES: &[NodeEntry] = &[
    NodeEntry {
        id: "comfyui_manager",
        name: "ComfyUI Manager",
        category: "management",
        repo: "https://github.com/ltdrdata/ComfyUI-Manager.git",
        required: true,
        description: "In-engine node browser and updater.",
    },
    NodeEntry {
        id: "video_helper_suite",
        name: "Video Helper Suite",
        category: "video",
        repo: "https://github.com/Kosinkadink/ComfyUI-VideoHelperSuite.git",
        required: false,
        description: "Video load/combine nodes used by most video workflows.",
    },
    NodeEntry {
        id: "impact_pack",
        name: "Impact Pack",
        category: "image",
        repo: "https://github.com/ltdrdata/ComfyUI-Impact-Pack.git",
        required: false,
        description: "Detailer, detection, and segmentation nodes.",
    },
    NodeEntry {
        id: "controlnet_aux",
        name: "ControlNet Aux",
        category: "controlnet",
        repo: "https://github.com/Fannovel16/comfyui_controlnet_aux.git",
        required: false,
        description: "ControlNet preprocessors (pose, depth, edges).",
    },
    NodeEntry {
        id: "comfyui_gguf",
        name: "ComfyUI-GGUF",
        category: "loaders",
        repo: "https://github.com/city96/ComfyUI-GGUF.git",
        required: false,
        description: "GGUF-quantized model loaders.",
    },
    NodeEntry {
        id: "kjnodes",
        name: "KJNodes",
        category: "utility",
        repo: "https://github.com/kijai/ComfyUI-KJNodes.git",
        required: false,
        description: "Utility nodes used across many shared workflows.",
    },
];

pub fn find(node_id: &str) -> Option<&'static NodeEntry> {
    CUSTOM_NODES.iter().find(|n| n.id == node_id)
}

pub fn all_categories() -> Vec<&'static str> {
    let mut categories: Vec<&'static str> = CUSTOM_NODES.iter().map(|n| n.category).collect();
    categories.sort_unstable();
    categories.dedup();
    categories
}

/// An installed node directory as found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct InstalledNode {
    pub name: String,
    pub path: String,
    pub has_requirements: bool,
}

pub struct NodeManager {
    env: Arc<Environment>,
}

impl NodeManager {
    pub fn new(env: Arc<Environment>) -> Self {
        NodeManager { env }
    }

    /// Directory name a repo clones into: the last path segment, `.git`
    /// stripped.
    fn repo_dir_name(repo: &str) -> &str {
        let last = repo.trim_end_matches('/').rsplit('/').next().unwrap_or(repo);
        last.strip_suffix(".git").unwrap_or(last)
    }

    /// Directory for a node name; rejects names that escape `custom_nodes`.
    fn node_dir(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return None;
        }
        Some(self.env.custom_nodes_dir().join(name))
    }

    pub fn status(&self, entry: &NodeEntry) -> &'static str {
        let installed = self
            .node_dir(Self::repo_dir_name(entry.repo))
            .map(|d| d.exists())
            .unwrap_or(false);
        if installed { "installed" } else { "missing" }
    }

    pub fn list_installed(&self) -> Vec<InstalledNode> {
        let Ok(entries) = std::fs::read_dir(self.env.custom_nodes_dir()) else {
            return Vec::new();
        };
        let mut nodes: Vec<InstalledNode> = entries
            .flatten()
            .filter_map(|entry| {
                if !entry.file_type().ok()?.is_dir() {
                    return None;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || name == "__pycache__" {
                    return None;
                }
                Some(InstalledNode {
                    has_requirements: entry.path().join("requirements.txt").exists(),
                    path: entry.path().display().to_string(),
                    name,
                })
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Install each node in turn; one failure does not abort the batch.
    pub fn install_multiple(
        &self,
        entries: &[&'static NodeEntry],
        progress: &ProgressSink,
    ) -> BTreeMap<String, bool> {
        let total = entries.len() as u64;
        let mut results = BTreeMap::new();
        for (i, entry) in entries.iter().enumerate() {
            progress(i as u64, total, &format!("Installing {}...", entry.name));
            let ok = match self.install_one(entry) {
                Ok(()) => true,
                Err(e) => {
                    warn!(node = entry.id, error = %format!("{e:#}"), "node install failed");
                    false
                }
            };
            results.insert(entry.id.to_string(), ok);
        }
        progress(total, total, "Node installs finished");
        results
    }

    fn install_one(&self, entry: &NodeEntry) -> Result<()> {
        let name = Self::repo_dir_name(entry.repo);
        let Some(dir) = self.node_dir(name) else {
            bail!("invalid node directory name: {name}");
        };
        if dir.exists() {
            return Ok(());
        }

        std::fs::create_dir_all(self.env.custom_nodes_dir())
            .context("create custom_nodes dir")?;
        let mut cmd = Command::new(self.env.git_program());
        cmd.arg("clone").arg(entry.repo).arg(&dir);
        run_tool(cmd, "git clone")?;

        let requirements = dir.join("requirements.txt");
        if requirements.exists() {
            let mut cmd = Command::new(self.env.interpreter());
            cmd.args(["-m", "pip", "install", "-r"])
                .arg(&requirements)
                .current_dir(&dir);
            run_tool(cmd, "pip install node requirements")?;
        }
        Ok(())
    }

    /// `git pull` one installed node. Failures are logged and reported as
    /// `false` so batch callers can aggregate.
    pub fn update_one(&self, name: &str) -> bool {
        let Some(dir) = self.node_dir(name) else {
            return false;
        };
        if !dir.exists() {
            return false;
        }
        let mut cmd = Command::new(self.env.git_program());
        cmd.arg("-C").arg(&dir).arg("pull");
        match run_tool(cmd, "git pull") {
            Ok(()) => true,
            Err(e) => {
                warn!(node = name, error = %format!("{e:#}"), "node update failed");
                false
            }
        }
    }

    pub fn update_all(&self, progress: &ProgressSink) -> BTreeMap<String, bool> {
        let installed = self.list_installed();
        let total = installed.len() as u64;
        let mut results = BTreeMap::new();
        for (i, node) in installed.iter().enumerate() {
            progress(i as u64, total, &format!("Updating {}...", node.name));
            results.insert(node.name.clone(), self.update_one(&node.name));
        }
        progress(total, total, "Node updates finished");
        results
    }

    /// Delete one installed node directory.
    pub fn remove(&self, name: &str) -> bool {
        let Some(dir) = self.node_dir(name) else {
            return false;
        };
        if !dir.exists() {
            return false;
        }
        std::fs::remove_dir_all(&dir).is_ok()
    }
}

// ---------- Unit tests ----------
