//! Engine instance endpoints, including the parallel batch operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::{blocking, parse_body, ApiError, ApiResult, AppState};
use crate::device::{Device, VramMode};
use crate::env::{DEFAULT_HOST, PORT_RANGE_START};
use crate::process::{noop_progress, ProgressSink};
use crate::registry::{validate_extra_args, InstanceConfig, InstanceState};

fn serialize_instance(state: &InstanceState) -> Value {
    json!({
        "instance_id": state.instance_id,
        "gpu_device": state.config.gpu_device,
        "gpu_label": state.config.gpu_label,
        "port": state.config.port,
        "host": state.config.host,
        "vram_mode": state.config.vram_mode,
        "extra_args": state.config.extra_args,
        "status": state.status(),
        "is_running": state.handle.is_running(),
        "url": format!("http://{}:{}", state.config.host, state.config.port),
    })
}

#[derive(Debug, Default, Deserialize)]
struct AddInstanceRequest {
    #[serde(default)]
    gpu_device: Option<Device>,
    #[serde(default)]
    gpu_label: Option<String>,
    #[serde(default, deserialize_with = "port_from_any")]
    port: Option<u16>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    vram_mode: Option<VramMode>,
    #[serde(default)]
    extra_args: Option<Vec<String>>,
}

/// Clients send ports as numbers or strings; accept both.
fn port_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    use serde::de::Error;
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom("port out of range")),
        Some(Value::String(s)) => s
            .parse::<u16>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid port '{s}'"))),
        Some(other) => Err(D::Error::custom(format!(
            "invalid port value: {other}"
        ))),
    }
}

/// GET /instances
pub async fn list_instances(State(state): State<AppState>) -> Json<Value> {
    let managers = state.managers();
    let instances: Vec<Value> = managers
        .registry
        .list()
        .iter()
        .map(|s| serialize_instance(s))
        .collect();
    Json(json!({
        "instances": instances,
        "running_count": managers.registry.running_count(),
        "vram_modes": VramMode::ALL.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
    }))
}

/// POST /instances — 201 with the new instance document.
pub async fn add_instance(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let managers = state.managers();
    let log_hub = state.log_hub();
    let req: AddInstanceRequest = parse_body(body)?;

    let gpu_device = req.gpu_device.unwrap_or(Device::Gpu(0));
    let gpu_label = req
        .gpu_label
        .unwrap_or_else(|| format!("GPU {gpu_device}"));
    let port = req
        .port
        .unwrap_or_else(|| managers.registry.next_available_port(PORT_RANGE_START));
    if port < 1024 {
        return Err(ApiError::Validation(
            "Port must be between 1024 and 65535.".to_string(),
        ));
    }
    let extra_args = req.extra_args.unwrap_or_default();
    validate_extra_args(&extra_args).map_err(ApiError::Validation)?;

    let config = InstanceConfig {
        gpu_device,
        gpu_label: gpu_label.clone(),
        port,
        host: req.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        vram_mode: req.vram_mode.unwrap_or(VramMode::Normal),
        extra_args,
    };

    let instance_id = managers.registry.add(config)?;
    log_hub.emit(
        format!("Added instance {instance_id} ({gpu_label} on port {port})"),
        "server",
    );

    let instance = managers
        .registry
        .get(&instance_id)
        .ok_or_else(|| ApiError::NotFound(format!("Instance {instance_id} not found")))?;
    Ok((StatusCode::CREATED, Json(serialize_instance(&instance))))
}

/// DELETE /instances/{id} — stops the instance first if running.
pub async fn remove_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let managers = state.managers();
    let log_hub = state.log_hub();

    if managers.registry.get(&id).is_none() {
        return Err(ApiError::NotFound(format!("Instance {id} not found")));
    }

    let registry = managers.registry.clone();
    let target = id.clone();
    let ok = blocking(move || registry.remove(&target)).await?;

    if ok {
        log_hub.emit(format!("Removed instance {id}"), "server");
    }
    Ok(Json(json!({ "ok": ok, "instance_id": id })))
}

/// POST /instances/{id}/start
pub async fn start_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let managers = state.managers();
    let log_hub = state.log_hub();

    if !managers.installer.is_installed() {
        return Err(ApiError::Validation(
            "ComfyUI not installed. Run install first.".to_string(),
        ));
    }
    let instance = managers
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Instance {id} not found")))?;

    if instance.handle.is_running() {
        return Ok(Json(json!({
            "ok": true, "instance_id": id, "message": "Already running"
        }))
        .into_response());
    }

    let hub = log_hub.clone();
    let progress: ProgressSink = Arc::new(move |_, _, message| hub.emit(message, "server"));
    log_hub.emit(format!("Starting instance {id}..."), "server");

    let registry = managers.registry.clone();
    let target = id.clone();
    let success = blocking(move || registry.start(&target, &progress)).await?;

    let instance = managers
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Instance {id} not found")))?;
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(serialize_instance(&instance))).into_response())
}

/// POST /instances/{id}/stop
pub async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let managers = state.managers();
    let log_hub = state.log_hub();

    let instance = managers
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Instance {id} not found")))?;

    if !instance.handle.is_running() {
        return Ok(Json(json!({
            "ok": true, "instance_id": id, "message": "Already stopped"
        }))
        .into_response());
    }

    let hub = log_hub.clone();
    let progress: ProgressSink = Arc::new(move |_, _, message| hub.emit(message, "server"));
    log_hub.emit(format!("Stopping instance {id}..."), "server");

    let registry = managers.registry.clone();
    let target = id.clone();
    blocking(move || registry.stop(&target, &progress)).await?;

    let instance = managers
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Instance {id} not found")))?;
    Ok(Json(serialize_instance(&instance)).into_response())
}

/// POST /instances/start-all — one worker per stopped instance, joined.
pub async fn start_all(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let managers = state.managers();
    let log_hub = state.log_hub();

    if !managers.installer.is_installed() {
        return Err(ApiError::Validation(
            "ComfyUI not installed. Run install first.".to_string(),
        ));
    }

    let to_start: Vec<String> = managers
        .registry
        .list()
        .iter()
        .filter(|s| !s.handle.is_running())
        .map(|s| s.instance_id.clone())
        .collect();

    if to_start.is_empty() {
        return Ok(Json(json!({
            "ok": true, "message": "No stopped instances", "started": 0
        })));
    }

    log_hub.emit(
        format!("Starting {} instance(s)...", to_start.len()),
        "server",
    );

    let mut tasks = Vec::with_capacity(to_start.len());
    for id in to_start {
        let registry = managers.registry.clone();
        let target = id.clone();
        tasks.push((
            id,
            tokio::task::spawn_blocking(move || registry.start(&target, &noop_progress())),
        ));
    }

    let mut results = BTreeMap::new();
    for (id, task) in tasks {
        results.insert(id, task.await.unwrap_or(false));
    }

    let started = results.values().filter(|ok| **ok).count();
    let total = results.len();
    log_hub.emit(format!("Started {started}/{total} instance(s)"), "server");

    Ok(Json(json!({
        "ok": true,
        "results": results,
        "started": started,
        "total": total,
    })))
}

/// POST /instances/stop-all
pub async fn stop_all(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let managers = state.managers();
    let log_hub = state.log_hub();

    if !managers.registry.any_running() {
        return Ok(Json(json!({ "ok": true, "message": "No running instances" })));
    }

    log_hub.emit("Stopping all instances...", "server");
    let registry = managers.registry.clone();
    let ok = blocking(move || registry.stop_all()).await?;
    log_hub.emit("All instances stopped", "server");

    Ok(Json(json!({ "ok": ok })))
}
