//! Active engine path management: target switch, saved installs, extra
//! model directories.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use super::{blocking, parse_body, ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
struct PathRequest {
    path: Option<String>,
}

fn required_path(body: Value) -> ApiResult<String> {
    let req: PathRequest = parse_body(body)?;
    match req.path {
        Some(path) if !path.is_empty() => Ok(path),
        _ => Err(ApiError::Validation("'path' is required".to_string())),
    }
}

/// GET /comfyui/target
pub async fn get_target(State(state): State<AppState>) -> Json<Value> {
    let managers = state.managers();
    Json(json!({
        "active_dir": managers.env.engine_dir.display().to_string(),
        "builtin_dir": state.builtin_engine_dir().display().to_string(),
        "is_external": managers.installer.is_external(),
    }))
}

/// PUT /comfyui/target — switch the active engine directory. Stops running
/// instances (they point into the old path) and rebuilds the managers.
pub async fn put_target(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let path_str = required_path(body)?;
    let path = PathBuf::from(&path_str);
    if !path.join("main.py").exists() {
        return Err(ApiError::Validation(format!(
            "No main.py found in {}",
            path.display()
        )));
    }

    // Persist + auto-add to the saved list.
    let settings = state.settings();
    let builtin = state.builtin_engine_dir().display().to_string();
    let mut saved = settings.saved_engine_dirs();
    let mut updates = serde_json::Map::new();
    updates.insert("comfyui_dir".to_string(), json!(path_str));
    if path_str != builtin && !saved.contains(&path_str) {
        saved.push(path_str.clone());
        updates.insert("saved_comfyui_dirs".to_string(), json!(saved));
    }
    settings.save(updates).map_err(ApiError::Internal)?;

    switch_to(&state, path.clone()).await?;
    state
        .log_hub()
        .emit(format!("Switched to: {}", path.display()), "config");

    Ok(Json(json!({
        "ok": true,
        "active_dir": path.display().to_string(),
    })))
}

/// POST /comfyui/target/reset — back to the built-in checkout.
pub async fn post_reset_target(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state
        .settings()
        .set("comfyui_dir", Value::Null)
        .map_err(ApiError::Internal)?;

    let builtin = state.builtin_engine_dir();
    switch_to(&state, builtin.clone()).await?;
    state
        .log_hub()
        .emit("Switched back to built-in ComfyUI", "config");

    Ok(Json(json!({
        "ok": true,
        "active_dir": builtin.display().to_string(),
    })))
}

async fn switch_to(state: &AppState, engine_dir: PathBuf) -> ApiResult<()> {
    let managers = state.managers();
    if managers.registry.any_running() {
        let registry = managers.registry.clone();
        blocking(move || registry.stop_all()).await?;
    }
    let state = state.clone();
    blocking(move || state.rebuild_managers(engine_dir)).await?;
    Ok(())
}

// ---- Saved engine installs ----

/// GET /comfyui/saved
pub async fn get_saved(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "saved": state.settings().saved_engine_dirs(),
        "builtin_dir": state.builtin_engine_dir().display().to_string(),
    }))
}

/// POST /comfyui/saved
pub async fn post_saved(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let path_str = required_path(body)?;
    let path = PathBuf::from(&path_str);
    if !path.join("main.py").exists() {
        return Err(ApiError::Validation(format!(
            "No main.py found in {}",
            path.display()
        )));
    }

    let settings = state.settings();
    let mut saved = settings.saved_engine_dirs();
    let builtin = state.builtin_engine_dir().display().to_string();
    if path_str != builtin && !saved.contains(&path_str) {
        saved.push(path_str.clone());
        settings
            .set("saved_comfyui_dirs", json!(saved))
            .map_err(ApiError::Internal)?;
    }

    state
        .log_hub()
        .emit(format!("Added saved ComfyUI: {path_str}"), "config");
    Ok(Json(json!({
        "ok": true,
        "saved": settings.saved_engine_dirs(),
    })))
}

/// DELETE /comfyui/saved
pub async fn delete_saved(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let path_str = required_path(body)?;
    if path_str == state.builtin_engine_dir().display().to_string() {
        return Err(ApiError::Validation(
            "Cannot remove the built-in ComfyUI.".to_string(),
        ));
    }

    let settings = state.settings();
    let mut saved = settings.saved_engine_dirs();
    if let Some(index) = saved.iter().position(|p| p == &path_str) {
        saved.remove(index);
        settings
            .set("saved_comfyui_dirs", json!(saved))
            .map_err(ApiError::Internal)?;
    }

    state
        .log_hub()
        .emit(format!("Removed saved ComfyUI: {path_str}"), "config");
    Ok(Json(json!({
        "ok": true,
        "saved": settings.saved_engine_dirs(),
    })))
}

// ---- Extra model directories ----

/// GET /comfyui/extra-dirs
pub async fn get_extra_dirs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "extra_dirs": state.settings().extra_model_dirs() }))
}

/// POST /comfyui/extra-dirs
pub async fn post_extra_dir(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let path_str = required_path(body)?;

    let settings = state.settings();
    let mut extras = settings.extra_model_dirs();
    if !extras.contains(&path_str) {
        extras.push(path_str.clone());
        settings
            .set("extra_model_dirs", json!(extras))
            .map_err(ApiError::Internal)?;
    }

    state
        .log_hub()
        .emit(format!("Added extra model dir: {path_str}"), "config");
    Ok(Json(json!({
        "ok": true,
        "extra_dirs": settings.extra_model_dirs(),
    })))
}

/// DELETE /comfyui/extra-dirs
pub async fn delete_extra_dir(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let path_str = required_path(body)?;

    let settings = state.settings();
    let mut extras = settings.extra_model_dirs();
    if let Some(index) = extras.iter().position(|p| p == &path_str) {
        extras.remove(index);
        settings
            .set("extra_model_dirs", json!(extras))
            .map_err(ApiError::Internal)?;
    }

    state
        .log_hub()
        .emit(format!("Removed extra model dir: {path_str}"), "config");
    Ok(Json(json!({
        "ok": true,
        "extra_dirs": settings.extra_model_dirs(),
    })))
}
