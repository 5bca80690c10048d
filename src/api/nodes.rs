//! Custom node registry, install, update, and remove endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{blocking, dispatch_job, parse_body, ApiError, ApiResult, AppState};
use crate::nodes::{self, NodeEntry};

#[derive(Debug, Default, Deserialize)]
pub struct RegistryQuery {
    category: Option<String>,
}

/// GET /nodes/registry?category=
pub async fn get_registry(
    State(state): State<AppState>,
    Query(query): Query<RegistryQuery>,
) -> ApiResult<Json<Value>> {
    let category = query.category.filter(|c| c != "all");

    let manager = state.managers().nodes.clone();
    let entries = blocking(move || {
        nodes::CUSTOM_NODES
            .iter()
            .filter(|n| category.as_deref().is_none_or(|c| n.category == c))
            .map(|n| {
                json!({
                    "id": n.id,
                    "name": n.name,
                    "category": n.category,
                    "description": n.description,
                    "repo": n.repo,
                    "required": n.required,
                    "status": manager.status(n),
                })
            })
            .collect::<Vec<_>>()
    })
    .await?;

    let count = entries.len();
    Ok(Json(json!({
        "nodes": entries,
        "count": count,
        "categories": nodes::all_categories(),
    })))
}

/// GET /nodes/installed
pub async fn get_installed(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let manager = state.managers().nodes.clone();
    let installed = blocking(move || manager.list_installed()).await?;
    let count = installed.len();
    Ok(Json(json!({ "nodes": installed, "count": count })))
}

#[derive(Debug, Deserialize)]
struct InstallRequest {
    #[serde(default)]
    node_ids: Vec<String>,
}

/// POST /nodes/install — install by id list. 202 with a job document.
pub async fn post_install(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let req: InstallRequest = parse_body(body)?;
    if req.node_ids.is_empty() {
        return Err(ApiError::Validation(
            "'node_ids' list is required".to_string(),
        ));
    }

    let mut to_install: Vec<&'static NodeEntry> = Vec::new();
    for id in &req.node_ids {
        let entry = nodes::find(id)
            .ok_or_else(|| ApiError::Validation(format!("Unknown node ID: {id}")))?;
        to_install.push(entry);
    }

    let names: Vec<&str> = to_install.iter().map(|n| n.name).collect();
    let job = state.jobs().create("install_nodes");

    let manager = state.managers().nodes.clone();
    dispatch_job(
        state.log_hub(),
        job.clone(),
        "nodes",
        format!(
            "Installing {} node(s): {}",
            to_install.len(),
            names.join(", ")
        ),
        "Node install",
        move |progress| {
            let results = manager.install_multiple(&to_install, progress);
            let success = results.values().filter(|ok| **ok).count();
            let failed = results.len() - success;
            Ok((
                json!({ "success": success, "failed": failed, "details": results }),
                format!("Node install complete: {success} succeeded, {failed} failed"),
            ))
        },
    );

    Ok((StatusCode::ACCEPTED, Json(job.view())))
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    node_names: Vec<String>,
}

/// POST /nodes/update — update installed nodes by name. 202 with a job
/// document.
pub async fn post_update(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let req: UpdateRequest = parse_body(body)?;
    if req.node_names.is_empty() {
        return Err(ApiError::Validation(
            "'node_names' list is required".to_string(),
        ));
    }

    let job = state.jobs().create("update_nodes");
    let manager = state.managers().nodes.clone();
    let node_names = req.node_names;

    dispatch_job(
        state.log_hub(),
        job.clone(),
        "nodes",
        format!("Updating {} node(s)...", node_names.len()),
        "Node update",
        move |progress| {
            let total = node_names.len();
            let mut results = std::collections::BTreeMap::new();
            for (i, name) in node_names.iter().enumerate() {
                progress(i as u64, total as u64, &format!("Updating {name}..."));
                results.insert(name.clone(), manager.update_one(name));
            }
            let success = results.values().filter(|ok| **ok).count();
            Ok((
                json!({
                    "success": success,
                    "failed": results.len() - success,
                    "details": results,
                }),
                format!("Node update complete: {success}/{total} succeeded"),
            ))
        },
    );

    Ok((StatusCode::ACCEPTED, Json(job.view())))
}

/// POST /nodes/update-all — update everything installed. 202 with a job
/// document.
pub async fn post_update_all(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let job = state.jobs().create("update_all_nodes");
    let manager = state.managers().nodes.clone();

    dispatch_job(
        state.log_hub(),
        job.clone(),
        "nodes",
        "Updating all installed nodes...".to_string(),
        "Update all",
        move |progress| {
            let results = manager.update_all(progress);
            let success = results.values().filter(|ok| **ok).count();
            let total = results.len();
            Ok((
                json!({
                    "success": success,
                    "failed": total - success,
                    "details": results,
                }),
                format!("Update all complete: {success}/{total} succeeded"),
            ))
        },
    );

    Ok((StatusCode::ACCEPTED, Json(job.view())))
}

/// DELETE /nodes/{name}
pub async fn delete_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let log_hub = state.log_hub();
    let manager = state.managers().nodes.clone();
    let target = name.clone();
    let ok = blocking(move || manager.remove(&target)).await?;

    if ok {
        log_hub.emit(format!("Removed node: {name}"), "nodes");
    } else {
        log_hub.emit(format!("Failed to remove node: {name}"), "nodes");
    }
    Ok(Json(json!({ "ok": ok, "name": name })))
}
