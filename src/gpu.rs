//! GPU detection via `nvidia-smi` (no driver bindings required).

use serde::Serialize;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    pub uuid: String,
}

pub struct GpuProbe;

impl GpuProbe {
    /// Enumerate NVIDIA GPUs by parsing `nvidia-smi` CSV output. Returns an
    /// empty list when `nvidia-smi` is unavailable or fails.
    pub fn detect() -> Vec<GpuInfo> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,memory.total,memory.free,uuid",
                "--format=csv,noheader,nounits",
            ])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                parse_csv(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(status = ?output.status, "nvidia-smi returned non-zero");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi not available");
                Vec::new()
            }
        }
    }
}

fn parse_csv(stdout: &str) -> Vec<GpuInfo> {
    let mut gpus = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 5 {
            continue;
        }
        let (Ok(index), Ok(total), Ok(free)) = (
            parts[0].parse::<u32>(),
            parts[2].parse::<u64>(),
            parts[3].parse::<u64>(),
        ) else {
            continue;
        };
        gpus.push(GpuInfo {
            index,
            name: parts[1].to_string(),
            memory_total_mb: total,
            memory_free_mb: free,
            uuid: parts[4].to_string(),
        });
    }
    gpus
}
