//! comfyctl — entry point
//!
//! One binary, two drivers: the REST/WebSocket API server (`--api`) and
//! direct CLI operations (install/start/stop/purge). Tracing logs go to
//! stderr; engine output in `--start` mode goes to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use comfyctl::api::{self, AppState};
use comfyctl::device::{Device, VramMode};
use comfyctl::env::{self, Environment, DEFAULT_HOST, DEFAULT_PORT};
use comfyctl::install::Installer;
use comfyctl::process::{LogSink, ProcessHandle, ProgressSink, StartSpec};
use comfyctl::settings::SettingsStore;

#[derive(Debug, Parser)]
#[command(name = "comfyctl")]
#[command(about = "ComfyUI installer and multi-instance manager", long_about = None)]
#[command(group(
    clap::ArgGroup::new("mode")
        .required(true)
        .args(["install", "start", "stop", "purge", "purge_all", "api"])
))]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run the full installation.
    #[arg(long)]
    install: bool,

    /// Start a ComfyUI server in the foreground.
    #[arg(long)]
    start: bool,

    /// Stop a previously started ComfyUI server.
    #[arg(long)]
    stop: bool,

    /// Remove ComfyUI (keeps the Python environment and models).
    #[arg(long)]
    purge: bool,

    /// Remove everything including models and the Python environment.
    #[arg(long)]
    purge_all: bool,

    /// Run the REST API server.
    #[arg(long)]
    api: bool,

    /// Engine port for --start.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Engine host for --start.
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// VRAM mode for --start.
    #[arg(long, value_enum, default_value_t = VramMode::Normal)]
    vram: VramMode,

    /// GPU device index (0, 1, ...) or 'cpu'. Default: use all GPUs.
    #[arg(long)]
    gpu: Option<Device>,

    /// API server port.
    #[arg(long, default_value_t = 5000)]
    api_port: u16,

    /// API server host.
    #[arg(long, default_value = "127.0.0.1")]
    api_host: String,

    /// Path to an external ComfyUI installation to manage.
    #[arg(long, value_name = "PATH")]
    comfyui_dir: Option<PathBuf>,

    /// Override the base directory for managed payloads and settings.
    #[arg(long, value_name = "PATH")]
    base_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout stays usable for engine output.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let base = env::resolve_base(cli.base_dir.as_deref());
    let settings = SettingsStore::new(base.join("settings.json"));

    // An explicit engine dir is validated and persisted before the mode runs.
    if let Some(dir) = &cli.comfyui_dir {
        if !dir.join("main.py").exists() {
            eprintln!("Error: No main.py found in {}", dir.display());
            eprintln!("Please specify a valid ComfyUI installation directory.");
            return Ok(1);
        }
        settings.set(
            "comfyui_dir",
            serde_json::json!(dir.display().to_string()),
        )?;
    }

    let builtin = env::builtin_engine_dir(&base);
    let active = settings.active_engine_dir(&builtin);
    let environment = Arc::new(Environment::new(base, active));

    if cli.api {
        run_api(environment, settings, &cli.api_host, cli.api_port)
    } else if cli.install {
        run_install(environment)
    } else if cli.start {
        run_start(environment, &cli.host, cli.port, cli.vram, cli.gpu)
    } else if cli.stop {
        run_stop(environment)
    } else if cli.purge {
        run_purge(environment, false)
    } else {
        run_purge(environment, true)
    }
}

fn run_api(
    environment: Arc<Environment>,
    settings: SettingsStore,
    host: &str,
    port: u16,
) -> Result<i32> {
    let state = AppState::new(environment, settings);
    let runtime = tokio::runtime::Runtime::new().context("build tokio runtime")?;
    runtime.block_on(api::serve(state, host, port))?;
    Ok(0)
}

fn cli_progress() -> ProgressSink {
    Arc::new(|current, total, message| {
        if total > 0 {
            println!("[{current}/{total}] {message}");
        } else {
            println!("{message}");
        }
    })
}

fn run_install(environment: Arc<Environment>) -> Result<i32> {
    println!("ComfyUI full installation");
    println!("{}", "=".repeat(40));

    let installer = Installer::new(environment);
    match installer.full_install(&cli_progress()) {
        Ok(()) => {
            println!("\nInstallation completed successfully!");
            Ok(0)
        }
        Err(e) => {
            eprintln!("\nInstallation failed: {e:#}");
            Ok(1)
        }
    }
}

fn run_start(
    environment: Arc<Environment>,
    host: &str,
    port: u16,
    vram: VramMode,
    gpu: Option<Device>,
) -> Result<i32> {
    let gpu_desc = match gpu {
        Some(Device::Cpu) => " on CPU".to_string(),
        Some(Device::Gpu(i)) => format!(" on GPU {i}"),
        None => String::new(),
    };
    println!("Starting ComfyUI server on {host}:{port}{gpu_desc}...");

    let installer = Installer::new(environment.clone());
    if !installer.is_installed() {
        eprintln!("Error: ComfyUI is not installed. Run with --install first.");
        return Ok(1);
    }

    let handle = ProcessHandle::new(environment);
    let sink: LogSink = Arc::new(|line: &str| println!("{line}"));
    let progress = cli_progress();

    let started = handle.start(
        StartSpec {
            host: host.to_string(),
            port,
            vram_mode: vram,
            extra_args: vec![],
            gpu_device: gpu,
            log_prefix: String::new(),
            log_sink: Some(sink),
        },
        &progress,
    );
    if !started {
        eprintln!("Failed to start server!");
        return Ok(1);
    }

    println!("\nServer running at http://{host}:{port}");
    println!("Press Ctrl-C to stop...");

    #[cfg(unix)]
    sigint::install();

    while handle.is_running() {
        #[cfg(unix)]
        if sigint::interrupted() {
            println!("\nStopping server...");
            handle.stop(&progress);
            break;
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
    Ok(0)
}

fn run_stop(environment: Arc<Environment>) -> Result<i32> {
    println!("Stopping ComfyUI server...");

    // A fresh handle owns no child; this only covers the same-process case
    // and otherwise reports that nothing is running.
    let handle = ProcessHandle::new(environment);
    if handle.is_running() {
        handle.stop(&cli_progress());
        println!("Server stopped.");
    } else {
        println!("Server is not running.");
    }
    Ok(0)
}

fn run_purge(environment: Arc<Environment>, purge_all: bool) -> Result<i32> {
    if purge_all {
        println!("ComfyUI FULL PURGE");
        println!("WARNING: This will delete EVERYTHING including models!");
    } else {
        println!("Purge ComfyUI");
        println!("This will delete ComfyUI but KEEP the Python environment and models.");
    }
    println!("{}", "=".repeat(40));

    print!("Are you sure? (yes/no): ");
    std::io::stdout().flush().ok();
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("read confirmation")?;
    let answer = answer.trim().to_lowercase();
    if answer != "yes" && answer != "y" {
        println!("Cancelled.");
        return Ok(0);
    }

    let installer = Installer::new(environment);
    let result = if purge_all {
        installer.purge_all(&cli_progress())
    } else {
        installer.purge(&cli_progress())
    };
    match result {
        Ok(()) => {
            println!("Purge completed.");
            Ok(0)
        }
        Err(e) => {
            eprintln!("Purge failed: {e:#}");
            Ok(1)
        }
    }
}

#[cfg(unix)]
mod sigint {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigint(_sig: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    pub fn install() {
        // SAFETY: the handler only stores to an atomic flag.
        unsafe {
            libc::signal(
                libc::SIGINT,
                on_sigint as extern "C" fn(libc::c_int) as usize,
            );
        }
    }

    pub fn interrupted() -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }
}
