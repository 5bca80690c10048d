//! Status, GPU, and settings endpoints.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::{blocking, ApiError, ApiResult, AppState};
use crate::gpu::GpuProbe;

/// GET /status — installation summary plus instance counts.
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let managers = state.managers();

    let installer = managers.installer.clone();
    let installation = blocking(move || installer.check_installation()).await?;
    let gpus = blocking(GpuProbe::detect).await?;

    let instances = managers.registry.list();
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "comfyui_dir": managers.env.engine_dir.display().to_string(),
        "base_dir": state.base_dir().display().to_string(),
        "python_ready": installation.env_ready,
        "comfyui_installed": installation.engine_installed,
        "requirements_installed": installation.requirements_installed,
        "models_dir_exists": installation.models_dir_exists,
        "gpu_count": gpus.len(),
        "gpus": gpus
            .iter()
            .map(|g| json!({
                "index": g.index,
                "name": g.name,
                "memory_total_mb": g.memory_total_mb,
            }))
            .collect::<Vec<_>>(),
        "instances_running": managers.registry.running_count(),
        "instances_total": instances.len(),
    })))
}

/// GET /gpus — detected GPUs with VRAM info.
pub async fn get_gpus(State(_state): State<AppState>) -> ApiResult<Json<Value>> {
    let gpus = blocking(GpuProbe::detect).await?;
    let nvidia_available = !gpus.is_empty();
    Ok(Json(json!({
        "gpus": gpus,
        "nvidia_available": nvidia_available,
    })))
}

/// GET /settings
pub async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    Json(Value::Object(state.settings().load()))
}

/// PUT /settings — merge the body into the persisted settings.
pub async fn put_settings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let Value::Object(updates) = body else {
        return Err(ApiError::Validation(
            "Settings body must be a JSON object".to_string(),
        ));
    };
    state.settings().save(updates).map_err(ApiError::Internal)?;
    Ok(Json(json!({ "ok": true })))
}
