//! Model registry, download, search, and local scan endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{blocking, dispatch_job, parse_body, ApiError, ApiResult, AppState};
use crate::env::MODEL_CATEGORIES;
use crate::models::{self, ModelEntry};

#[derive(Debug, Default, Deserialize)]
pub struct RegistryQuery {
    category: Option<String>,
}

fn entry_json(entry: &ModelEntry, status: &str) -> Value {
    json!({
        "id": entry.id,
        "name": entry.name,
        "folder": entry.folder,
        "size_gb": entry.size_gb,
        "repo": entry.repo,
        "filename": entry.filename,
        "status": status,
    })
}

/// GET /models/registry?category=
pub async fn get_registry(
    State(state): State<AppState>,
    Query(query): Query<RegistryQuery>,
) -> ApiResult<Json<Value>> {
    let managers = state.managers();
    let category = query.category.filter(|c| c != "all");

    let downloader = managers.models.clone();
    let entries = blocking(move || {
        models::MODELS
            .iter()
            .filter(|m| category.as_deref().is_none_or(|c| m.folder == c))
            .map(|m| entry_json(m, downloader.status(m)))
            .collect::<Vec<_>>()
    })
    .await?;

    let count = entries.len();
    Ok(Json(json!({ "models": entries, "count": count })))
}

/// GET /models/registry/{id}
pub async fn get_registry_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let entry = models::find(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Model {id} not found in registry")))?;

    let downloader = state.managers().models.clone();
    let status = blocking(move || downloader.status(entry)).await?;

    let mut doc = entry_json(entry, status);
    doc["description"] = json!(entry.description);
    Ok(Json(doc))
}

/// GET /models/local — scan the models directory.
pub async fn get_local(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let downloader = state.managers().models.clone();
    let local = blocking(move || downloader.scan_local()).await?;
    let total: usize = local.values().map(Vec::len).sum();
    Ok(Json(json!({ "models": local, "total": total })))
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    model_ids: Vec<String>,
}

/// POST /models/download — download by id list. 202 with a job document.
pub async fn post_download(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let req: DownloadRequest = parse_body(body)?;
    if req.model_ids.is_empty() {
        return Err(ApiError::Validation(
            "'model_ids' list is required".to_string(),
        ));
    }

    let managers = state.managers();
    let mut to_download: Vec<&'static ModelEntry> = Vec::new();
    for id in &req.model_ids {
        let entry = models::find(id)
            .ok_or_else(|| ApiError::Validation(format!("Unknown model ID: {id}")))?;
        if !managers.models.exists(entry) {
            to_download.push(entry);
        }
    }

    if to_download.is_empty() {
        return Ok(Json(json!({
            "ok": true,
            "message": "All selected models are already installed.",
        }))
        .into_response());
    }

    let total_gb: f64 = to_download.iter().map(|m| m.size_gb).sum();
    let names: Vec<&str> = to_download.iter().map(|m| m.name).collect();
    let job = state.jobs().create("download_models");

    let downloader = managers.models.clone();
    dispatch_job(
        state.log_hub(),
        job.clone(),
        "models",
        format!(
            "Downloading {} model(s) (~{total_gb:.1} GB): {}",
            to_download.len(),
            names.join(", ")
        ),
        "Download",
        move |progress| {
            let results = downloader.download_multiple(&to_download, progress);
            let success = results.values().filter(|ok| **ok).count();
            let failed = results.len() - success;
            Ok((
                json!({ "success": success, "failed": failed, "details": results }),
                format!("Download complete: {success} succeeded, {failed} failed"),
            ))
        },
    );

    Ok((StatusCode::ACCEPTED, Json(job.view())).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    q: Option<String>,
    limit: Option<usize>,
}

/// GET /models/search?q=&limit=
pub async fn get_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let q = query
        .q
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::Validation("'q' query parameter is required".to_string()))?;
    let limit = query.limit.unwrap_or(20);

    let downloader = state.managers().models.clone();
    let results = blocking(move || downloader.search(&q, limit))
        .await?
        .map_err(ApiError::Internal)?;

    let count = results.len();
    Ok(Json(json!({ "results": results, "count": count })))
}

/// GET /models/categories
pub async fn get_categories() -> Json<Value> {
    Json(json!({ "categories": MODEL_CATEGORIES }))
}
