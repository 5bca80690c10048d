//! Model asset registry, local scan, HuggingFace search and download.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::process::ProgressSink;

/// One curated registry asset. `repo`/`filename` address the file on the
/// HuggingFace hub; `folder` is the engine model category it lands in.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub folder: &'static str,
    pub size_gb: f64,
    pub repo: &'static str,
    pub filename: &'static str,
    pub description: &'static str,
}

pub static MODELS: &[ModelEntry] = &[
    ModelEntry {
        id: "sdxl_base",
        name: "SDXL Base 1.0",
        folder: "checkpoints",
        size_gb: 6.9,
        repo: "stabilityai/stable-diffusion-xl-base-1.0",
        filename: "sd_xl_base_1.0.safetensors",
        description: "Stable Diffusion XL base checkpoint, 1024x1024 native.",
    },
    ModelEntry {
        id: "sdxl_vae",
        name: "SDXL VAE",
        folder: "vae",
        size_gb: 0.3,
        repo: "stabilityai/sdxl-vae",
        filename: "sdxl_vae.safetensors",
        description: "Standalone VAE for SDXL checkpoints.",
    },
    ModelEntry {
        id: "sd15",
        name: "Stable Diffusion 1.5",
        folder: "checkpoints",
        size_gb: 4.0,
        repo: "stable-diffusion-v1-5/stable-diffusion-v1-5",
        filename: "v1-5-pruned-emaonly.safetensors",
        description: "Classic SD 1.5 checkpoint, widest custom-node support.",
    },
    ModelEntry {
        id: "flux_schnell",
        name: "FLUX.1 Schnell",
        folder: "diffusion_models",
        size_gb: 23.8,
        repo: "black-forest-labs/FLUX.1-schnell",
        filename: "flux1-schnell.safetensors",
        description: "Fast FLUX.1 distilled model (4-step).",
    },
    ModelEntry {
        id: "t5xxl_fp16",
        name: "T5-XXL Text Encoder (fp16)",
        folder: "text_encoders",
        size_gb: 9.8,
        repo: "comfyanonymous/flux_text_encoders",
        filename: "t5xxl_fp16.safetensors",
        description: "Text encoder required by FLUX models.",
    },
    ModelEntry {
        id: "clip_l",
        name: "CLIP-L Text Encoder",
        folder: "text_encoders",
        size_gb: 0.2,
        repo: "comfyanonymous/flux_text_encoders",
        filename: "clip_l.safetensors",
        description: "CLIP-L encoder used alongside T5-XXL.",
    },
    ModelEntry {
        id: "flux_ae",
        name: "FLUX AE",
        folder: "vae",
        size_gb: 0.3,
        repo: "black-forest-labs/FLUX.1-schnell",
        filename: "ae.safetensors",
        description: "Autoencoder for FLUX models.",
    },
    ModelEntry {
        id: "realesrgan_x4",
        name: "RealESRGAN x4plus",
        folder: "upscale_models",
        size_gb: 0.06,
        repo: "ai-forever/Real-ESRGAN",
        filename: "RealESRGAN_x4.pth",
        description: "General-purpose 4x upscaler.",
    },
];

pub fn find(model_id: &str) -> Option<&'static ModelEntry> {
    MODELS.iter().find(|m| m.id == model_id)
}

/// A model file found on disk during a local scan.
#[derive(Debug, Clone, Serialize)]
pub struct LocalModel {
    pub name: String,
    pub size_gb: f64,
    pub folder: String,
    pub path: String,
}

/// A HuggingFace search hit. Extra fields from the API are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub struct ModelDownloader {
    models_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl ModelDownloader {
    pub fn new(models_dir: PathBuf) -> Self {
        ModelDownloader {
            models_dir,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn target_path(&self, entry: &ModelEntry) -> PathBuf {
        self.models_dir.join(entry.folder).join(entry.filename)
    }

    pub fn exists(&self, entry: &ModelEntry) -> bool {
        self.target_path(entry).exists()
    }

    pub fn status(&self, entry: &ModelEntry) -> &'static str {
        if self.exists(entry) { "installed" } else { "missing" }
    }

    /// Download each asset in turn, reporting per-file progress. Returns a
    /// per-id success map; one failed download does not abort the batch.
    pub fn download_multiple(
        &self,
        entries: &[&'static ModelEntry],
        progress: &ProgressSink,
    ) -> BTreeMap<String, bool> {
        let total = entries.len() as u64;
        let mut results = BTreeMap::new();
        for (i, entry) in entries.iter().enumerate() {
            progress(i as u64, total, &format!("Downloading {}...", entry.name));
            let ok = match self.download_one(entry, i as u64, total, progress) {
                Ok(()) => true,
                Err(e) => {
                    warn!(model = entry.id, error = %format!("{e:#}"), "download failed");
                    false
                }
            };
            results.insert(entry.id.to_string(), ok);
        }
        progress(total, total, "Downloads finished");
        results
    }

    fn download_one(
        &self,
        entry: &ModelEntry,
        index: u64,
        total: u64,
        progress: &ProgressSink,
    ) -> Result<()> {
        let url = format!(
            "https://huggingface.co/{}/resolve/main/{}",
            entry.repo, entry.filename
        );
        let target = self.target_path(entry);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let mut response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("request {url}"))?
            .error_for_status()
            .with_context(|| format!("download {}", entry.filename))?;
        let total_bytes = response.content_length().unwrap_or(0);

        // Write to a partial file, rename only when complete.
        let partial = target.with_extension("part");
        let mut file = std::fs::File::create(&partial)
            .with_context(|| format!("create {}", partial.display()))?;

        let mut buf = vec![0u8; 1 << 20];
        let mut downloaded: u64 = 0;
        let mut last_reported_mb: u64 = 0;
        loop {
            let n = response.read(&mut buf).context("read download stream")?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).context("write model file")?;
            downloaded += n as u64;

            let mb = downloaded >> 20;
            if mb >= last_reported_mb + 64 {
                last_reported_mb = mb;
                progress(
                    index,
                    total,
                    &format!("{}: {} / {} MB", entry.name, mb, total_bytes >> 20),
                );
            }
        }
        file.flush().context("flush model file")?;
        drop(file);
        std::fs::rename(&partial, &target)
            .with_context(|| format!("finalize {}", target.display()))?;

        info!(model = entry.id, bytes = downloaded, "model downloaded");
        Ok(())
    }

    /// Walk the models directory and group files by category folder.
    pub fn scan_local(&self) -> BTreeMap<String, Vec<LocalModel>> {
        let mut result = BTreeMap::new();
        let Ok(categories) = std::fs::read_dir(&self.models_dir) else {
            return result;
        };

        for category in categories.flatten() {
            let Ok(file_type) = category.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let folder = category.file_name().to_string_lossy().to_string();
            let models = scan_category(&category.path(), &folder);
            if !models.is_empty() {
                result.insert(folder, models);
            }
        }
        result
    }

    /// Search the HuggingFace model hub.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .get("https://huggingface.co/api/models")
            .query(&[("search", query), ("limit", &limit.to_string())])
            .timeout(Duration::from_secs(10))
            .send()
            .context("query huggingface")?
            .error_for_status()
            .context("huggingface search")?;
        let results: Vec<SearchResult> = response.json().context("parse search results")?;
        Ok(results)
    }
}

fn scan_category(dir: &Path, folder: &str) -> Vec<LocalModel> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut models: Vec<LocalModel> = entries
        .flatten()
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // Skip partial downloads and hidden files.
            if name.starts_with('.') || name.ends_with(".part") {
                return None;
            }
            Some(LocalModel {
                name,
                size_gb: meta.len() as f64 / 1e9,
                folder: folder.to_string(),
                path: entry.path().display().to_string(),
            })
        })
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));
    models
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::noop_progress;

    #[test]
    fn registry_ids_are_unique_and_findable() {
        let mut seen = std::collections::HashSet::new();
        for entry in MODELS {
            assert!(seen.insert(entry.id), "duplicate id {}", entry.id);
            assert!(find(entry.id).is_some());
            assert!(!entry.repo.is_empty() && !entry.filename.is_empty());
        }
        assert!(find("no_such_model").is_none());
    }

    #[test]
    fn status_reflects_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = ModelDownloader::new(tmp.path().to_path_buf());
        let entry = find("sdxl_vae").unwrap();

        assert_eq!(downloader.status(entry), "missing");
        assert!(!downloader.exists(entry));

        let target = tmp.path().join(entry.folder).join(entry.filename);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"weights").unwrap();
        assert_eq!(downloader.status(entry), "installed");
    }

    #[test]
    fn scan_local_groups_by_category() {
        let tmp = tempfile::tempdir().unwrap();
        let models = tmp.path();
        std::fs::create_dir_all(models.join("checkpoints")).unwrap();
        std::fs::create_dir_all(models.join("vae")).unwrap();
        std::fs::create_dir_all(models.join("loras")).unwrap();
        std::fs::write(models.join("checkpoints").join("b.safetensors"), b"bb").unwrap();
        std::fs::write(models.join("checkpoints").join("a.safetensors"), b"aa").unwrap();
        std::fs::write(models.join("checkpoints").join("x.part"), b"partial").unwrap();
        std::fs::write(models.join("vae").join("v.safetensors"), b"v").unwrap();

        let downloader = ModelDownloader::new(models.to_path_buf());
        let scanned = downloader.scan_local();

        assert_eq!(scanned.len(), 2, "empty categories are omitted");
        let checkpoints = &scanned["checkpoints"];
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].name, "a.safetensors");
        assert_eq!(checkpoints[1].name, "b.safetensors");
        assert_eq!(scanned["vae"][0].folder, "vae");
    }

    #[test]
    fn scan_local_missing_dir_is_empty() {
        let downloader = ModelDownloader::new(PathBuf::from("/nonexistent/models"));
        assert!(downloader.scan_local().is_empty());
        assert!(
            downloader
                .download_multiple(&[], &noop_progress())
                .is_empty()
        );
    }
}
