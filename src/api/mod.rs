//! HTTP control surface
//!
//! Thin facade over the download engine: create, inspect and steer tasks,
//! probe image sizes, and upgrade to the WebSocket event stream. Every
//! response body wraps `{ code, data?, message? }`.

pub mod ws;

use crate::download::{CreateRequest, DownloadEngine};
use crate::error::FetcherError;
use crate::logging::format_size;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DownloadEngine>,
    pub started_at: Instant,
}

pub fn router(engine: Arc<DownloadEngine>) -> Router {
    let state = AppState {
        engine,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/downloads", post(create_download).get(list_downloads))
        .route(
            "/api/downloads/:id",
            get(inspect_download).delete(delete_download),
        )
        .route("/api/downloads/:id/pause", post(pause_download))
        .route("/api/downloads/:id/resume", post(resume_download))
        .route("/api/downloads/:id/cancel", post(cancel_download))
        .route("/api/downloads/:id/retry", post(retry_download))
        .route("/api/images/size", get(image_size))
        .route("/api/ws", get(ws::ws_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            code: 200,
            data: Some(data),
            message: None,
        }),
    )
        .into_response()
}

fn fail(err: &FetcherError) -> Response {
    let (status, message) = match err {
        FetcherError::InvalidArgument(_) | FetcherError::InvalidState(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        FetcherError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        // Detail stays in the log; clients get a generic message
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
    };
    (
        status,
        Json(ApiResponse::<serde_json::Value> {
            code: status.as_u16(),
            data: None,
            message: Some(message),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(result: crate::error::Result<T>) -> Response {
    match result {
        Ok(data) => ok(data),
        Err(err) => fail(&err),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    timestamp: String,
    uptime: u64,
}

async fn health(State(state): State<AppState>) -> Response {
    ok(HealthBody {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDownloadBody {
    pub image_name: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub source: String,
    #[serde(default)]
    pub target_path: Option<PathBuf>,
    #[serde(default)]
    pub platform: Option<String>,
}

async fn create_download(
    State(state): State<AppState>,
    Json(body): Json<CreateDownloadBody>,
) -> Response {
    let request = CreateRequest {
        image_name: body.image_name,
        tag: body.tag,
        source: body.source,
        target_path: body.target_path,
        platform: body.platform,
    };
    respond(state.engine.create_task(request).await)
}

async fn list_downloads(State(state): State<AppState>) -> Response {
    ok(state.engine.list_tasks().await)
}

async fn inspect_download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.engine.inspect_task(&id).await)
}

async fn pause_download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.engine.pause_task(&id).await)
}

async fn resume_download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.engine.resume_task(&id).await)
}

async fn cancel_download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.engine.cancel_task(&id).await)
}

async fn retry_download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.engine.retry_task(&id).await)
}

async fn delete_download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(
        state
            .engine
            .delete_task(&id)
            .await
            .map(|()| serde_json::json!({ "deleted": id })),
    )
}

#[derive(Debug, Deserialize)]
pub struct SizeQuery {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SizeBody {
    size_bytes: u64,
    size: String,
}

async fn image_size(State(state): State<AppState>, Query(query): Query<SizeQuery>) -> Response {
    let result = state
        .engine
        .probe_size(&query.source, &query.name, query.tag.as_deref())
        .await
        .map(|size_bytes| SizeBody {
            size_bytes,
            size: format_size(size_bytes),
        });
    respond(result)
}
