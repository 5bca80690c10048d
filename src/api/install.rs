//! Installation endpoints: install, update, purge, SageAttention.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use super::{blocking, dispatch_job, ApiError, ApiResult, AppState};

/// POST /install — kick off the full install. 202 with a job document.
pub async fn post_install(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let managers = state.managers();
    let job = state.jobs().create("install");

    let installer = managers.installer.clone();
    dispatch_job(
        state.log_hub(),
        job.clone(),
        "install",
        "Starting full installation...".to_string(),
        "Installation",
        move |progress| {
            installer.full_install(progress)?;
            Ok((json!(true), "Installation completed successfully!".to_string()))
        },
    );

    Ok((StatusCode::ACCEPTED, Json(job.view())))
}

/// POST /install/sage-attention
pub async fn post_install_sage(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let managers = state.managers();
    if !managers.env.env_ready() {
        return Err(ApiError::Validation(
            "Python environment not set up. Run install first.".to_string(),
        ));
    }

    let job = state.jobs().create("install_sage_attention");
    let installer = managers.installer.clone();
    dispatch_job(
        state.log_hub(),
        job.clone(),
        "install",
        "Installing Triton + SageAttention...".to_string(),
        "SageAttention",
        move |progress| {
            installer.install_sage_attention(progress)?;
            Ok((json!(true), "SageAttention installed!".to_string()))
        },
    );

    Ok((StatusCode::ACCEPTED, Json(job.view())))
}

/// POST /update — update the engine checkout. 202 with a job document.
pub async fn post_update(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let managers = state.managers();
    if !managers.installer.is_installed() {
        return Err(ApiError::Validation("ComfyUI not installed.".to_string()));
    }

    let job = state.jobs().create("update_comfyui");
    let installer = managers.installer.clone();
    dispatch_job(
        state.log_hub(),
        job.clone(),
        "install",
        "Updating ComfyUI...".to_string(),
        "Update",
        move |progress| {
            installer.update(progress)?;
            Ok((json!(true), "Update completed!".to_string()))
        },
    );

    Ok((StatusCode::ACCEPTED, Json(job.view())))
}

/// POST /purge — remove the engine, keep models and the environment.
pub async fn post_purge(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let managers = state.managers();
    let log_hub = state.log_hub();
    if !managers.installer.is_installed() {
        return Err(ApiError::Validation(
            "ComfyUI not installed. Nothing to purge.".to_string(),
        ));
    }

    // Running instances point into the directory being deleted.
    if managers.registry.any_running() {
        let registry = managers.registry.clone();
        blocking(move || registry.stop_all()).await?;
    }

    let installer = managers.installer.clone();
    let hub = log_hub.clone();
    let success = blocking(move || {
        hub.emit("Purging ComfyUI...", "install");
        installer.purge(&crate::process::noop_progress())
    })
    .await?;

    match &success {
        Ok(()) => log_hub.emit("Purge completed!", "install"),
        Err(e) => log_hub.emit(format!("Purge failed: {e:#}"), "install"),
    }
    Ok(Json(json!({ "ok": success.is_ok() })))
}

/// POST /purge-all — remove everything including models and the
/// environment payloads.
pub async fn post_purge_all(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let managers = state.managers();
    let log_hub = state.log_hub();

    if managers.registry.any_running() {
        let registry = managers.registry.clone();
        blocking(move || registry.stop_all()).await?;
    }

    let installer = managers.installer.clone();
    let hub = log_hub.clone();
    let success = blocking(move || {
        hub.emit("Purging all (ComfyUI + models + Python env)...", "install");
        installer.purge_all(&crate::process::noop_progress())
    })
    .await?;

    match &success {
        Ok(()) => log_hub.emit("Full purge completed!", "install"),
        Err(e) => log_hub.emit(format!("Full purge failed: {e:#}"), "install"),
    }
    Ok(Json(json!({ "ok": success.is_ok() })))
}
