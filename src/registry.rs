//! Multi-instance registry: orchestrates engine instances across GPUs/ports.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Device, VramMode};
use crate::env::{Environment, MAX_INSTANCES, PORT_RANGE_END};
use crate::process::{noop_progress, LogSink, ProcessHandle, ProgressSink, StartSpec};

/// Configuration for a single engine instance. Frozen after `add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub gpu_device: Device,
    /// Human-readable label, e.g. "GPU 0: RTX 4090".
    pub gpu_label: String,
    pub port: u16,
    pub host: String,
    pub vram_mode: VramMode,
    pub extra_args: Vec<String>,
}

impl InstanceConfig {
    /// Intake coercion: a CPU device forces the CPU VRAM mode.
    pub fn normalized(mut self) -> Self {
        if self.gpu_device.is_cpu() {
            self.vram_mode = VramMode::Cpu;
        }
        self
    }
}

/// Flags derived from the instance config that callers must not smuggle in
/// through `extra_args`.
pub fn validate_extra_args(args: &[String]) -> Result<(), String> {
    for arg in args {
        let flag = arg.split('=').next().unwrap_or(arg.as_str());
        if flag == "--listen" || flag == "--port" || flag == "--cpu" {
            return Err(format!(
                "'{flag}' is derived from the instance config and cannot be passed in extra_args"
            ));
        }
        if flag.starts_with("--") && flag.contains("vram") {
            return Err(format!(
                "'{flag}' conflicts with vram_mode and cannot be passed in extra_args"
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Error => "error",
        }
    }
}

/// Runtime state of a single engine instance.
pub struct InstanceState {
    pub instance_id: String,
    pub config: InstanceConfig,
    pub handle: ProcessHandle,
    status: Mutex<InstanceStatus>,
}

impl InstanceState {
    /// Reported status. A recorded `running` with a dead child reads as
    /// `stopped`; a recorded `error` persists until the next successful
    /// start.
    pub fn status(&self) -> InstanceStatus {
        let status = *self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status == InstanceStatus::Running && !self.handle.is_running() {
            InstanceStatus::Stopped
        } else {
            status
        }
    }

    fn set_status(&self, status: InstanceStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Maximum of {MAX_INSTANCES} instances reached")]
    LimitExceeded,
    #[error("Port {port} already in use by instance {instance_id}")]
    PortInUse { port: u16, instance_id: String },
}

/// Thread-safe collection of engine instances.
///
/// One mutex guards the list; anything that can block (spawn, kill, pipe
/// I/O) runs on an `Arc<InstanceState>` snapshot with the lock released.
pub struct InstanceRegistry {
    env: Arc<Environment>,
    log_sink: Option<LogSink>,
    instances: Mutex<Vec<Arc<InstanceState>>>,
}

impl InstanceRegistry {
    pub fn new(env: Arc<Environment>, log_sink: Option<LogSink>) -> Self {
        InstanceRegistry {
            env,
            log_sink,
            instances: Mutex::new(Vec::new()),
        }
    }

    /// Register a new instance. Fails on the instance cap or a port held by
    /// an existing instance.
    pub fn add(&self, config: InstanceConfig) -> Result<String, RegistryError> {
        let config = config.normalized();
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if instances.len() >= MAX_INSTANCES {
            return Err(RegistryError::LimitExceeded);
        }
        if let Some(existing) = instances.iter().find(|s| s.config.port == config.port) {
            return Err(RegistryError::PortInUse {
                port: config.port,
                instance_id: existing.instance_id.clone(),
            });
        }

        let base_id = format!("{}_{}", config.gpu_device.id_component(), config.port);
        let mut instance_id = base_id.clone();
        let mut counter = 2;
        while instances.iter().any(|s| s.instance_id == instance_id) {
            instance_id = format!("{base_id}_{counter}");
            counter += 1;
        }

        instances.push(Arc::new(InstanceState {
            instance_id: instance_id.clone(),
            config,
            handle: ProcessHandle::new(self.env.clone()),
            status: Mutex::new(InstanceStatus::Stopped),
        }));
        Ok(instance_id)
    }

    /// Stop (if running) and delete an instance. `false` for an unknown id.
    pub fn remove(&self, instance_id: &str) -> bool {
        let Some(state) = self.get(instance_id) else {
            return false;
        };

        // Stop outside the lock (may block for the kill budget).
        if state.handle.is_running() {
            state.handle.stop(&noop_progress());
        }

        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        instances.retain(|s| s.instance_id != instance_id);
        true
    }

    /// Start one instance. Starts for different ids run in parallel; starts
    /// for the same id are serialized by the handle.
    pub fn start(&self, instance_id: &str, progress: &ProgressSink) -> bool {
        let Some(state) = self.get(instance_id) else {
            return false;
        };

        state.set_status(InstanceStatus::Starting);
        let cfg = &state.config;
        let prefix = make_prefix(cfg);

        let sink = self.log_sink.clone().map(|forward| {
            let prefix = prefix.clone();
            // The pump already prefixes; don't double it if a line arrives
            // with the prefix attached.
            Arc::new(move |line: &str| {
                if line.starts_with(prefix.as_str()) {
                    forward(line);
                } else {
                    forward(&format!("{prefix} {line}"));
                }
            }) as LogSink
        });

        let success = state.handle.start(
            StartSpec {
                host: cfg.host.clone(),
                port: cfg.port,
                vram_mode: cfg.vram_mode,
                extra_args: cfg.extra_args.clone(),
                gpu_device: Some(cfg.gpu_device),
                log_prefix: prefix,
                log_sink: sink,
            },
            progress,
        );

        state.set_status(if success {
            InstanceStatus::Running
        } else {
            InstanceStatus::Error
        });
        success
    }

    /// Stop one instance. A non-running instance is left untouched so a
    /// recorded `error` survives until the next successful start.
    pub fn stop(&self, instance_id: &str, progress: &ProgressSink) -> bool {
        let Some(state) = self.get(instance_id) else {
            return false;
        };
        if !state.handle.is_running() {
            return true;
        }

        let success = state.handle.stop(progress);
        if success {
            state.set_status(InstanceStatus::Stopped);
        }
        success
    }

    /// Stop every running instance. Returns true iff every stop succeeded.
    pub fn stop_all(&self) -> bool {
        let running: Vec<Arc<InstanceState>> = {
            let instances = self
                .instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            instances
                .iter()
                .filter(|s| s.handle.is_running())
                .cloned()
                .collect()
        };

        let mut all_ok = true;
        for state in running {
            if state.handle.stop(&noop_progress()) {
                state.set_status(InstanceStatus::Stopped);
            } else {
                all_ok = false;
            }
        }
        all_ok
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<InstanceState>> {
        let instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        instances
            .iter()
            .find(|s| s.instance_id == instance_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<InstanceState>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn running_count(&self) -> usize {
        self.list()
            .iter()
            .filter(|s| s.handle.is_running())
            .count()
    }

    pub fn any_running(&self) -> bool {
        self.list().iter().any(|s| s.handle.is_running())
    }

    /// First port in `[base, PORT_RANGE_END]` not claimed by an instance;
    /// one past the range end when saturated.
    pub fn next_available_port(&self, base: u16) -> u16 {
        let used: Vec<u16> = self.list().iter().map(|s| s.config.port).collect();
        for port in base..=PORT_RANGE_END {
            if !used.contains(&port) {
                return port;
            }
        }
        PORT_RANGE_END + 1
    }
}

/// Log prefix for an instance: `[CPU:<port>]` or `[GPU<i>:<port>]`.
fn make_prefix(config: &InstanceConfig) -> String {
    format!(
        "[{}:{}]",
        config.gpu_device.prefix_component(),
        config.port
    )
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{self, PORT_RANGE_START};
    use std::path::PathBuf;

    fn registry() -> InstanceRegistry {
        let base = PathBuf::from("/nonexistent/comfyctl-test");
        let engine = env::builtin_engine_dir(&base);
        InstanceRegistry::new(Arc::new(Environment::new(base, engine)), None)
    }

    fn config(device: Device, port: u16) -> InstanceConfig {
        InstanceConfig {
            gpu_device: device,
            gpu_label: format!("GPU {device}"),
            port,
            host: "127.0.0.1".to_string(),
            vram_mode: VramMode::Normal,
            extra_args: vec![],
        }
    }

    #[test]
    fn add_derives_deterministic_ids() {
        let reg = registry();
        assert_eq!(reg.add(config(Device::Gpu(0), 8188)).unwrap(), "gpu0_8188");
        assert_eq!(reg.add(config(Device::Cpu, 8189)).unwrap(), "cpu_8189");
        assert_eq!(reg.add(config(Device::Gpu(1), 8190)).unwrap(), "gpu1_8190");
    }

    #[test]
    fn add_rejects_port_collision() {
        let reg = registry();
        reg.add(config(Device::Gpu(0), 8188)).unwrap();
        let err = reg.add(config(Device::Gpu(1), 8188)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Port 8188 already in use by instance gpu0_8188"
        );
    }

    #[test]
    fn add_enforces_instance_cap() {
        let reg = registry();
        for i in 0..MAX_INSTANCES {
            reg.add(config(Device::Gpu(0), 8188 + i as u16)).unwrap();
        }
        let err = reg.add(config(Device::Gpu(0), 9000)).unwrap_err();
        assert!(matches!(err, RegistryError::LimitExceeded));
        assert_eq!(err.to_string(), "Maximum of 8 instances reached");
    }

    #[test]
    fn ports_stay_unique_over_add_remove() {
        let reg = registry();
        let a = reg.add(config(Device::Gpu(0), 8188)).unwrap();
        assert!(reg.add(config(Device::Cpu, 8188)).is_err());
        assert!(reg.remove(&a));
        // Port freed by removal.
        assert_eq!(reg.add(config(Device::Cpu, 8188)).unwrap(), "cpu_8188");
    }

    #[test]
    fn cpu_device_coerces_vram_mode() {
        let reg = registry();
        let id = reg.add(config(Device::Cpu, 8188)).unwrap();
        let state = reg.get(&id).unwrap();
        assert_eq!(state.config.vram_mode, VramMode::Cpu);
    }

    #[test]
    fn remove_unknown_is_false() {
        let reg = registry();
        assert!(!reg.remove("nope"));
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn next_available_port_skips_used() {
        let reg = registry();
        assert_eq!(reg.next_available_port(PORT_RANGE_START), 8188);
        reg.add(config(Device::Gpu(0), 8188)).unwrap();
        reg.add(config(Device::Gpu(0), 8189)).unwrap();
        assert_eq!(reg.next_available_port(PORT_RANGE_START), 8190);
    }

    #[test]
    fn next_available_port_when_saturated() {
        let reg = registry();
        for port in 8188..=8195 {
            reg.add(config(Device::Gpu(0), port)).unwrap();
        }
        // The cap (8) leaves 8196..=8199 free; a saturated sub-range still
        // yields the first free port, and a fully-claimed range overflows.
        assert_eq!(reg.next_available_port(8188), 8196);
        assert_eq!(reg.next_available_port(8196), 8196);
    }

    #[test]
    fn stop_all_with_nothing_running() {
        let reg = registry();
        reg.add(config(Device::Gpu(0), 8188)).unwrap();
        assert!(reg.stop_all());
        assert_eq!(reg.running_count(), 0);
        assert!(!reg.any_running());
    }

    #[test]
    fn start_unknown_is_false() {
        let reg = registry();
        assert!(!reg.start("ghost", &noop_progress()));
        assert!(!reg.stop("ghost", &noop_progress()));
    }

    #[test]
    fn start_without_engine_marks_error() {
        // The registry's environment points at a directory with no main.py,
        // so the handle refuses to start and the status records the failure.
        let reg = registry();
        let id = reg.add(config(Device::Gpu(0), 8188)).unwrap();
        assert!(!reg.start(&id, &noop_progress()));
        let state = reg.get(&id).unwrap();
        assert_eq!(state.status(), InstanceStatus::Error);
        assert_eq!(state.status().as_str(), "error");
        // A stop on the errored (non-running) instance leaves the error.
        assert!(reg.stop(&id, &noop_progress()));
        assert_eq!(state.status(), InstanceStatus::Error);
    }

    #[test]
    fn validate_extra_args_rejects_derived_flags() {
        assert!(validate_extra_args(&[]).is_ok());
        assert!(validate_extra_args(&["--preview-method".into(), "auto".into()]).is_ok());
        for bad in ["--listen", "--port", "--cpu", "--lowvram", "--novram", "--reserve-vram=2"] {
            assert!(
                validate_extra_args(&[bad.to_string()]).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn prefix_format() {
        assert_eq!(make_prefix(&config(Device::Cpu, 8188)), "[CPU:8188]");
        assert_eq!(make_prefix(&config(Device::Gpu(2), 8190)), "[GPU2:8190]");
    }
}
