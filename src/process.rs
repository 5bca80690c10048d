//! Engine process handle: spawn, log pump, readiness probe, tree-kill.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::{Device, VramMode};
use crate::env::Environment;
use crate::kill;

/// Receives one already-prefixed engine log line. Called from pump threads.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Progress protocol: `(current, total, message)`. Advisory; callees must
/// tolerate a no-op sink. May be invoked from any thread.
pub type ProgressSink = Arc<dyn Fn(u64, u64, &str) + Send + Sync>;

pub fn noop_progress() -> ProgressSink {
    Arc::new(|_, _, _| {})
}

/// Everything one engine launch needs. Saved by the handle so `restart`
/// can reuse it.
#[derive(Clone)]
pub struct StartSpec {
    pub host: String,
    pub port: u16,
    pub vram_mode: VramMode,
    pub extra_args: Vec<String>,
    /// `None` leaves CUDA device visibility untouched (all GPUs).
    pub gpu_device: Option<Device>,
    pub log_prefix: String,
    pub log_sink: Option<LogSink>,
}

/// Overrides applied on top of the saved spec by [`ProcessHandle::restart`].
#[derive(Clone, Default)]
pub struct StartOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vram_mode: Option<VramMode>,
    pub extra_args: Option<Vec<String>>,
    pub gpu_device: Option<Option<Device>>,
}

enum Readiness {
    Ready,
    SlowStart,
    Died,
}

#[derive(Default)]
struct HandleState {
    child: Option<Child>,
    spec: Option<StartSpec>,
}

/// Owns exactly one engine child process.
///
/// `start`/`stop`/`restart` are serialized by an internal operation lock, so
/// concurrent calls for the same handle queue up; the late caller observes
/// the already-changed state and returns immediately. The state lock is only
/// ever held for non-blocking work.
pub struct ProcessHandle {
    env: Arc<Environment>,
    op: Mutex<()>,
    state: Mutex<HandleState>,
}

impl ProcessHandle {
    pub fn new(env: Arc<Environment>) -> Self {
        ProcessHandle {
            env,
            op: Mutex::new(()),
            state: Mutex::new(HandleState::default()),
        }
    }

    /// True while the child exists and has not exited.
    pub fn is_running(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Start the engine. Returns `true` once the readiness probe answers,
    /// or when the probe budget elapses with the child still alive
    /// (slow-start tolerance). Spawn failures and a child that dies during
    /// startup are reported through `progress` and return `false`.
    pub fn start(&self, spec: StartSpec, progress: &ProgressSink) -> bool {
        let _op = self.op.lock().unwrap_or_else(PoisonError::into_inner);
        self.start_locked(spec, progress)
    }

    /// Stop the engine and its whole process tree: terminate, wait up to
    /// 10 s, force-kill, wait up to 5 s, reap. Abandons with `false` if the
    /// child still will not die.
    pub fn stop(&self, progress: &ProgressSink) -> bool {
        let _op = self.op.lock().unwrap_or_else(PoisonError::into_inner);
        self.stop_locked(progress)
    }

    /// Stop, pause 2 s, start again with the saved parameters, any of which
    /// may be overridden.
    pub fn restart(&self, overrides: StartOverrides, progress: &ProgressSink) -> bool {
        let _op = self.op.lock().unwrap_or_else(PoisonError::into_inner);

        let saved = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.spec.clone()
        };
        let Some(mut spec) = saved else {
            progress(0, 100, "Error: server was never started");
            return false;
        };

        progress(0, 100, "Restarting server...");
        if !self.stop_locked(&noop_progress()) {
            return false;
        }
        std::thread::sleep(Duration::from_secs(2));

        if let Some(host) = overrides.host {
            spec.host = host;
        }
        if let Some(port) = overrides.port {
            spec.port = port;
        }
        if let Some(vram_mode) = overrides.vram_mode {
            spec.vram_mode = vram_mode;
        }
        if let Some(extra_args) = overrides.extra_args {
            spec.extra_args = extra_args;
        }
        if let Some(gpu_device) = overrides.gpu_device {
            spec.gpu_device = gpu_device;
        }
        self.start_locked(spec, progress)
    }

    fn start_locked(&self, spec: StartSpec, progress: &ProgressSink) -> bool {
        if self.is_running() {
            progress(100, 100, "Server already running");
            return true;
        }

        let main_py = self.env.main_py();
        if !main_py.exists() {
            progress(0, 100, "Error: ComfyUI not installed");
            return false;
        }

        let interpreter = self.env.interpreter();
        if interpreter.is_absolute() && !interpreter.exists() {
            progress(
                0,
                100,
                &format!("Error: Python not found at {}", interpreter.display()),
            );
            return false;
        }

        progress(0, 100, "Starting ComfyUI server...");

        let mut cmd = Command::new(&interpreter);
        cmd.arg(&main_py)
            .arg("--listen")
            .arg(&spec.host)
            .arg("--port")
            .arg(spec.port.to_string());
        for flag in spec.vram_mode.flags() {
            cmd.arg(flag);
        }
        cmd.args(&spec.extra_args);

        // Pin to a specific GPU, hide all GPUs for CPU mode, or clear
        // restrictions when no device was requested.
        match spec.gpu_device {
            Some(Device::Cpu) => {
                cmd.env("CUDA_VISIBLE_DEVICES", "");
            }
            Some(Device::Gpu(index)) => {
                cmd.env("CUDA_VISIBLE_DEVICES", index.to_string());
            }
            None => {
                cmd.env_remove("CUDA_VISIBLE_DEVICES");
            }
        }

        // Portable git and ffmpeg must be visible to custom nodes.
        let additions = self.env.path_prepend();
        if !additions.is_empty() {
            let mut parts = additions;
            if let Some(existing) = std::env::var_os("PATH") {
                parts.extend(std::env::split_paths(&existing));
            }
            if let Ok(joined) = std::env::join_paths(parts) {
                cmd.env("PATH", joined);
            }
        }

        cmd.current_dir(&self.env.engine_dir).stdin(Stdio::null());
        if spec.log_sink.is_some() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            // Nothing will drain the pipes; don't let the engine block on them.
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        #[cfg(unix)]
        {
            // Own process group so the whole tree can be signalled at once.
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                progress(0, 100, &format!("Error: {e}"));
                return false;
            }
        };
        info!(port = spec.port, pid = child.id(), "engine process spawned");

        if let Some(sink) = spec.log_sink.clone() {
            if let Some(stdout) = child.stdout.take() {
                pump_lines(stdout, spec.log_prefix.clone(), sink.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                pump_lines(stderr, spec.log_prefix.clone(), sink);
            }
        }

        let host = spec.host.clone();
        let port = spec.port;
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.child = Some(child);
            state.spec = Some(spec);
        }

        progress(50, 100, "Waiting for server to start...");
        match self.wait_until_ready(&host, port) {
            Readiness::Ready => {
                progress(100, 100, &format!("Server running at http://{host}:{port}"));
                true
            }
            Readiness::SlowStart => {
                progress(
                    50,
                    100,
                    "Server still starting (process alive, not responding yet)",
                );
                true
            }
            Readiness::Died => {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(mut child) = state.child.take() {
                    let _ = child.wait();
                }
                progress(0, 100, "Server process died during startup");
                false
            }
        }
    }

    /// Poll `/system_stats` once per interval until the budget elapses.
    /// Probe I/O errors are expected while the engine boots and are
    /// swallowed.
    fn wait_until_ready(&self, host: &str, port: u16) -> Readiness {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.env.probe_request_timeout)
            .build();
        let Ok(client) = client else {
            return if self.is_running() {
                Readiness::SlowStart
            } else {
                Readiness::Died
            };
        };

        let url = format!("http://{host}:{port}/system_stats");
        let deadline = Instant::now() + self.env.readiness_timeout;
        while Instant::now() < deadline {
            if !self.is_running() {
                return Readiness::Died;
            }
            if let Ok(resp) = client.get(&url).send()
                && resp.status() == reqwest::StatusCode::OK
            {
                return Readiness::Ready;
            }
            std::thread::sleep(self.env.probe_interval);
        }

        if self.is_running() {
            Readiness::SlowStart
        } else {
            Readiness::Died
        }
    }

    fn stop_locked(&self, progress: &ProgressSink) -> bool {
        if !self.is_running() {
            progress(100, 100, "Server not running");
            return true;
        }

        progress(0, 100, "Stopping server...");

        let pid = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.child.as_ref().map(|c| c.id())
        };
        let Some(pid) = pid else {
            progress(100, 100, "Server not running");
            return true;
        };

        if let Err(e) = kill::terminate_tree(pid) {
            warn!(pid, error = %e, "terminate failed, escalating");
        }
        if self.wait_for_exit(Duration::from_secs(10)) {
            self.finish_stop(progress);
            return true;
        }

        debug!(pid, "terminate timed out, sending kill");
        if let Err(e) = kill::kill_tree(pid) {
            warn!(pid, error = %e, "kill failed");
        }
        if self.wait_for_exit(Duration::from_secs(5)) {
            self.finish_stop(progress);
            return true;
        }

        progress(0, 100, "Error stopping server: process did not exit");
        false
    }

    fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_running() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        !self.is_running()
    }

    fn finish_stop(&self, progress: &ProgressSink) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut child) = state.child.take() {
            // Reap the zombie so the handle is released.
            let _ = child.wait();
        }
        if let Some(spec) = state.spec.as_mut() {
            spec.gpu_device = None;
            spec.log_prefix.clear();
        }
        drop(state);
        progress(100, 100, "Server stopped");
    }
}

/// Forward lines from a child pipe to the sink, prepending `prefix` unless
/// the line already carries it. The thread exits at EOF.
fn pump_lines<R: Read + Send + 'static>(stream: R, prefix: String, sink: LogSink) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let text = line.trim_end();
            if prefix.is_empty() || text.starts_with(prefix.as_str()) {
                sink(text);
            } else {
                sink(&format!("{prefix} {text}"));
            }
        }
    });
}

// ---------- Unit tests ----------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::env;
    use std::path::PathBuf;

    /// Fake engine rooted in a temp dir: `main.py` is a shell script run by
    /// the overridden `/bin/sh` interpreter.
    fn fake_engine(script: &str, readiness_ms: u64) -> (tempfile::TempDir, Arc<Environment>) {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        let engine = env::builtin_engine_dir(&base);
        std::fs::create_dir_all(&engine).unwrap();
        std::fs::write(engine.join("main.py"), script).unwrap();

        let mut environment = Environment::new(base, engine);
        environment.interpreter_override = Some(PathBuf::from("/bin/sh"));
        environment.readiness_timeout = Duration::from_millis(readiness_ms);
        environment.probe_interval = Duration::from_millis(100);
        (tmp, Arc::new(environment))
    }

    fn spec(port: u16, sink: Option<LogSink>) -> StartSpec {
        StartSpec {
            host: "127.0.0.1".to_string(),
            port,
            vram_mode: VramMode::Normal,
            extra_args: vec![],
            gpu_device: Some(Device::Gpu(0)),
            log_prefix: format!("[GPU0:{port}]"),
            log_sink: sink,
        }
    }

    #[test]
    fn start_is_optimistic_while_child_alive() {
        let (_tmp, environment) = fake_engine("sleep 30\n", 400);
        let handle = ProcessHandle::new(environment);

        assert!(handle.start(spec(18901, None), &noop_progress()));
        assert!(handle.is_running());

        // Second start short-circuits on the live child.
        assert!(handle.start(spec(18901, None), &noop_progress()));

        assert!(handle.stop(&noop_progress()));
        assert!(!handle.is_running());
    }

    #[test]
    fn start_fails_when_child_dies() {
        let (_tmp, environment) = fake_engine("exit 3\n", 2000);
        let handle = ProcessHandle::new(environment);

        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let progress: ProgressSink = Arc::new(move |_, _, m| sink.lock().unwrap().push(m.into()));

        assert!(!handle.start(spec(18902, None), &progress));
        assert!(!handle.is_running());
        let messages = messages.lock().unwrap();
        assert!(
            messages.iter().any(|m| m.contains("died during startup")),
            "got {messages:?}"
        );
    }

    #[test]
    fn start_fails_without_engine_entry() {
        let (_tmp, environment) = fake_engine("sleep 1\n", 400);
        std::fs::remove_file(environment.main_py()).unwrap();
        let handle = ProcessHandle::new(environment);

        assert!(!handle.start(spec(18903, None), &noop_progress()));
    }

    #[test]
    fn log_pump_prefixes_lines() {
        let (_tmp, environment) = fake_engine("echo booting\nsleep 30\n", 500);
        let handle = ProcessHandle::new(environment);

        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: LogSink = Arc::new(move |line| captured.lock().unwrap().push(line.into()));

        assert!(handle.start(spec(18904, Some(sink)), &noop_progress()));
        // The echo happens immediately; the start call already waited out
        // the readiness budget.
        std::thread::sleep(Duration::from_millis(200));
        assert!(handle.stop(&noop_progress()));

        let lines = lines.lock().unwrap();
        assert!(
            lines.iter().any(|l| l == "[GPU0:18904] booting"),
            "got {lines:?}"
        );
    }

    #[test]
    fn stop_kills_spawned_children() {
        // The engine forks a worker; stopping must take the group down.
        let (_tmp, environment) = fake_engine("sleep 60 &\nsleep 60\n", 400);
        let handle = ProcessHandle::new(environment);

        assert!(handle.start(spec(18905, None), &noop_progress()));
        assert!(handle.stop(&noop_progress()));
        assert!(!handle.is_running());
    }

    #[test]
    fn restart_preserves_saved_spec() {
        let (_tmp, environment) = fake_engine("sleep 30\n", 300);
        let handle = ProcessHandle::new(environment);

        assert!(handle.start(spec(18906, None), &noop_progress()));
        assert!(handle.restart(StartOverrides::default(), &noop_progress()));
        assert!(handle.is_running());
        assert!(handle.stop(&noop_progress()));
    }

    #[test]
    fn stop_when_not_running_is_ok() {
        let (_tmp, environment) = fake_engine("sleep 1\n", 300);
        let handle = ProcessHandle::new(environment);
        assert!(handle.stop(&noop_progress()));
    }
}
