//! REST + WebSocket transport: shared state, error envelope, router, and
//! the worker-dispatch bridge between HTTP handlers and blocking work.

pub mod install;
pub mod instances;
pub mod jobs;
pub mod logs;
pub mod models;
pub mod nodes;
pub mod status;
pub mod target;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::env::{self, Environment};
use crate::install::Installer;
use crate::jobs::{JobRecord, JobRegistry};
use crate::loghub::LogHub;
use crate::models::ModelDownloader;
use crate::nodes::NodeManager;
use crate::process::ProgressSink;
use crate::registry::{InstanceRegistry, RegistryError};
use crate::settings::SettingsStore;

/// The environment-scoped collaborators. Rebuilt as a unit when the active
/// engine directory changes.
#[derive(Clone)]
pub struct Managers {
    pub env: Arc<Environment>,
    pub registry: Arc<InstanceRegistry>,
    pub installer: Arc<Installer>,
    pub models: Arc<ModelDownloader>,
    pub nodes: Arc<NodeManager>,
}

impl Managers {
    fn build(env: Arc<Environment>, log_hub: &Arc<LogHub>) -> Self {
        Managers {
            registry: Arc::new(InstanceRegistry::new(
                env.clone(),
                Some(log_hub.sink("server")),
            )),
            installer: Arc::new(Installer::new(env.clone())),
            models: Arc::new(ModelDownloader::new(env.models_dir())),
            nodes: Arc::new(NodeManager::new(env.clone())),
            env,
        }
    }
}

struct AppStateInner {
    base_dir: PathBuf,
    settings: SettingsStore,
    log_hub: Arc<LogHub>,
    jobs: Arc<JobRegistry>,
    managers: RwLock<Managers>,
}

/// Shared handler state. Cheap to clone; everything mutable lives behind
/// its own lock with non-blocking critical sections.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

impl AppState {
    pub fn new(env: Arc<Environment>, settings: SettingsStore) -> Self {
        let log_hub = Arc::new(LogHub::new());
        let managers = Managers::build(env.clone(), &log_hub);
        AppState {
            inner: Arc::new(AppStateInner {
                base_dir: env.base_dir.clone(),
                settings,
                log_hub,
                jobs: Arc::new(JobRegistry::new()),
                managers: RwLock::new(managers),
            }),
        }
    }

    pub fn managers(&self) -> Managers {
        self.inner
            .managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn log_hub(&self) -> Arc<LogHub> {
        self.inner.log_hub.clone()
    }

    pub fn jobs(&self) -> Arc<JobRegistry> {
        self.inner.jobs.clone()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn builtin_engine_dir(&self) -> PathBuf {
        env::builtin_engine_dir(&self.inner.base_dir)
    }

    /// Swap every environment-scoped collaborator to a new engine
    /// directory. Callers stop running instances first; the old registry is
    /// dropped with the old managers.
    pub(crate) fn rebuild_managers(&self, engine_dir: PathBuf) {
        let current = self.managers().env;
        let mut next = (*current).clone();
        next.engine_dir = engine_dir;
        let managers = Managers::build(Arc::new(next), &self.inner.log_hub);
        *self
            .inner
            .managers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = managers;
    }
}

/// Uniform error envelope. Validation and conflicts are 400, unknown ids
/// 404, everything unexpected 500 — never logged at error level except the
/// 500s.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": message })),
            )
                .into_response(),
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(e) => {
                error!(error = %format!("{e:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "Internal server error",
                        "detail": format!("{e:#}"),
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// Deserialize a JSON body into a typed request; failures surface as 400.
pub(crate) fn parse_body<T: DeserializeOwned>(value: Value) -> ApiResult<T> {
    serde_json::from_value(value).map_err(|e| ApiError::Validation(format!("Invalid request: {e}")))
}

/// Run blocking collaborator work on the pool, mapping a vanished worker to
/// a 500.
pub(crate) async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("worker thread failed")
        .map_err(ApiError::Internal)
}

/// Hand a job's work to the worker pool. The closure returns the result
/// payload plus the concluding log line; any error (or panic) fails the job
/// and nothing crosses the worker boundary.
pub(crate) fn dispatch_job<F>(
    log_hub: Arc<LogHub>,
    job: Arc<JobRecord>,
    tag: &'static str,
    start_message: String,
    error_label: &'static str,
    work: F,
) where
    F: FnOnce(&ProgressSink) -> anyhow::Result<(Value, String)> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        job.start();
        log_hub.emit(start_message, tag);
        let progress = job.progress_sink();

        match catch_unwind(AssertUnwindSafe(|| work(&progress))) {
            Ok(Ok((result, done_message))) => {
                job.complete(result);
                log_hub.emit(done_message, tag);
            }
            Ok(Err(e)) => {
                let message = format!("{e:#}");
                job.fail(message.clone());
                log_hub.emit(format!("{error_label} error: {message}"), tag);
            }
            Err(_) => {
                job.fail("internal error");
                log_hub.emit(format!("{error_label} error: internal error"), tag);
            }
        }
    });
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status::get_status))
        .route("/gpus", get(status::get_gpus))
        .route(
            "/settings",
            get(status::get_settings).put(status::put_settings),
        )
        .route("/install", post(install::post_install))
        .route("/install/sage-attention", post(install::post_install_sage))
        .route("/update", post(install::post_update))
        .route("/purge", post(install::post_purge))
        .route("/purge-all", post(install::post_purge_all))
        .route(
            "/comfyui/target",
            get(target::get_target).put(target::put_target),
        )
        .route("/comfyui/target/reset", post(target::post_reset_target))
        .route(
            "/comfyui/saved",
            get(target::get_saved)
                .post(target::post_saved)
                .delete(target::delete_saved),
        )
        .route(
            "/comfyui/extra-dirs",
            get(target::get_extra_dirs)
                .post(target::post_extra_dir)
                .delete(target::delete_extra_dir),
        )
        // start-all/stop-all are literal paths and must be registered
        // before the {id} routes.
        .route("/instances/start-all", post(instances::start_all))
        .route("/instances/stop-all", post(instances::stop_all))
        .route(
            "/instances",
            get(instances::list_instances).post(instances::add_instance),
        )
        .route("/instances/{id}", delete(instances::remove_instance))
        .route("/instances/{id}/start", post(instances::start_instance))
        .route("/instances/{id}/stop", post(instances::stop_instance))
        .route("/models/registry", get(models::get_registry))
        .route("/models/registry/{id}", get(models::get_registry_model))
        .route("/models/local", get(models::get_local))
        .route("/models/download", post(models::post_download))
        .route("/models/search", get(models::get_search))
        .route("/models/categories", get(models::get_categories))
        .route("/nodes/registry", get(nodes::get_registry))
        .route("/nodes/installed", get(nodes::get_installed))
        .route("/nodes/install", post(nodes::post_install))
        .route("/nodes/update", post(nodes::post_update))
        .route("/nodes/update-all", post(nodes::post_update_all))
        .route("/nodes/{name}", delete(nodes::delete_node))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/logs", get(logs::get_logs))
        .route("/ws/logs", get(logs::ws_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until Ctrl-C, then stop all engine instances and close
/// every log subscriber.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state.clone());
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind API listener on {addr}"))?;
    info!("API server listening on {addr}");
    state.log_hub().emit("[API] Server started", "system");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.log_hub().emit("[API] Server shutting down...", "system");
    let managers = state.managers();
    if managers.registry.any_running() {
        let registry = managers.registry.clone();
        let _ = tokio::task::spawn_blocking(move || registry.stop_all()).await;
    }
    state.log_hub().close_all();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
