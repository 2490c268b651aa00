//! REST API routes

use crate::config;
use crate::db::HistoryRecord;
use crate::download::{
    template_escapes, DownloadItem, ItemId, QueueError, QueueStats, SubmitOptions,
};
use crate::process::ProcessHandle;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Create API routes
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Downloads
        .route("/downloads", get(list_downloads))
        .route("/downloads", post(add_download))
        .route("/downloads/stats", get(download_stats))
        .route("/downloads/pause-all", post(pause_all))
        .route("/downloads/resume-all", post(resume_all))
        .route("/downloads/clear-finished", post(clear_finished))
        .route("/downloads/{id}", get(get_download))
        .route("/downloads/{id}", delete(remove_download))
        .route("/downloads/{id}/pause", post(pause_download))
        .route("/downloads/{id}/resume", post(resume_download))
        .route("/downloads/{id}/retry", post(retry_download))
        .route("/downloads/{id}/prioritize", post(prioritize_download))
        .route("/downloads/{id}/position", put(move_download))
        .route("/processes", get(list_processes))
        // Settings
        .route("/settings", get(get_settings))
        .route("/settings", put(update_settings))
        // History
        .route("/history", get(list_history))
        .route("/history", delete(clear_history))
}

// ============ Download Endpoints ============

/// List all downloads in queue order
async fn list_downloads(State(state): State<Arc<AppState>>) -> Json<Vec<DownloadItem>> {
    Json(state.queue.items())
}

/// Request to add a new download
#[derive(Debug, Deserialize)]
pub struct AddDownloadRequest {
    pub url: String,
    #[serde(flatten)]
    pub options: SubmitOptions,
}

/// Response after adding a download
#[derive(Debug, Serialize, Deserialize)]
pub struct AddDownloadResponse {
    pub id: ItemId,
}

/// Add a new download
async fn add_download(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddDownloadRequest>,
) -> Result<(StatusCode, Json<AddDownloadResponse>), AppError> {
    let id = state.queue.submit(&req.url, req.options)?;
    Ok((StatusCode::CREATED, Json(AddDownloadResponse { id })))
}

async fn get_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ItemId>,
) -> Result<Json<DownloadItem>, AppError> {
    current(&state, &id)
}

/// Remove a download, stopping it first if it is running
async fn remove_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ItemId>,
) -> Result<StatusCode, AppError> {
    state.queue.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ItemId>,
) -> Result<Json<DownloadItem>, AppError> {
    state.queue.pause(&id).await?;
    current(&state, &id)
}

async fn resume_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ItemId>,
) -> Result<Json<DownloadItem>, AppError> {
    state.queue.resume(&id)?;
    current(&state, &id)
}

async fn retry_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ItemId>,
) -> Result<Json<DownloadItem>, AppError> {
    state.queue.retry(&id)?;
    current(&state, &id)
}

async fn prioritize_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ItemId>,
) -> Result<Json<Vec<ItemId>>, AppError> {
    if state.queue.get(&id).is_none() {
        return Err(QueueError::NotFound(id).into());
    }
    state.queue.prioritize(&id);
    Ok(Json(state.queue.order()))
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub position: usize,
}

async fn move_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ItemId>,
    Json(req): Json<MoveRequest>,
) -> Result<Json<Vec<ItemId>>, AppError> {
    state.queue.reorder(&id, req.position)?;
    Ok(Json(state.queue.order()))
}

async fn pause_all(State(state): State<Arc<AppState>>) -> Json<QueueStats> {
    state.queue.pause_all().await;
    Json(state.queue.stats())
}

async fn resume_all(State(state): State<Arc<AppState>>) -> Json<QueueStats> {
    state.queue.resume_all();
    Json(state.queue.stats())
}

async fn clear_finished(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let removed = state.queue.clear_finished();
    Json(serde_json::json!({ "removed": removed }))
}

/// Get download statistics
async fn download_stats(State(state): State<Arc<AppState>>) -> Json<QueueStats> {
    Json(state.queue.stats())
}

/// Tool processes currently alive, for diagnostics
async fn list_processes(State(state): State<Arc<AppState>>) -> Json<Vec<ProcessHandle>> {
    Json(state.queue.supervisor().live())
}

fn current(state: &AppState, id: &ItemId) -> Result<Json<DownloadItem>, AppError> {
    state
        .queue
        .get(id)
        .map(Json)
        .ok_or_else(|| QueueError::NotFound(id.clone()).into())
}

// ============ Settings Endpoints ============

/// Settings exposed to front ends
#[derive(Debug, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub max_concurrent: usize,
    pub stop_grace_ms: u64,
    pub output_template: String,
    pub max_automatic_retries: u32,
    pub history_enabled: bool,
}

impl SettingsResponse {
    fn from_state(state: &AppState) -> Self {
        let settings = state.settings.read();
        Self {
            max_concurrent: settings.downloads.concurrency_limit(),
            stop_grace_ms: settings.downloads.stop_grace_ms,
            output_template: settings.downloads.output_template.clone(),
            max_automatic_retries: settings.downloads.retry.max_automatic_retries,
            history_enabled: settings.history.enabled,
        }
    }
}

/// Get current settings
async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsResponse> {
    Json(SettingsResponse::from_state(&state))
}

/// Update settings request
#[derive(Debug, Default, Deserialize)]
pub struct UpdateSettingsRequest {
    pub max_concurrent: Option<usize>,
    pub stop_grace_ms: Option<u64>,
    pub output_template: Option<String>,
    pub max_automatic_retries: Option<u32>,
    pub history_enabled: Option<bool>,
}

/// Update settings
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<SettingsResponse>, AppError> {
    if let Some(template) = &req.output_template {
        if template.trim().is_empty() || template_escapes(template) {
            return Err(AppError::BadRequest(
                "output_template must be a non-empty path inside the destination".into(),
            ));
        }
    }

    // Goes through the queue so a higher ceiling dispatches right away.
    if let Some(max) = req.max_concurrent {
        state.queue.set_concurrency_limit(max);
    }

    let snapshot = {
        let mut settings = state.settings.write();
        if let Some(grace) = req.stop_grace_ms {
            settings.downloads.stop_grace_ms = grace;
        }
        if let Some(template) = req.output_template {
            settings.downloads.output_template = template;
        }
        if let Some(retries) = req.max_automatic_retries {
            settings.downloads.retry.max_automatic_retries = retries;
        }
        if let Some(enabled) = req.history_enabled {
            settings.history.enabled = enabled;
        }
        settings.clone()
    };

    if let Some(path) = &state.config_path {
        config::save_to(&snapshot, path)?;
    }
    info!("Settings updated");

    Ok(Json(SettingsResponse::from_state(&state)))
}

// ============ History Endpoints ============

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    100
}

async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryRecord>>, AppError> {
    Ok(Json(state.history.recent(query.limit)?))
}

async fn clear_history(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.history.clear()?;
    info!("Cleared {} history entries", removed);
    Ok(Json(serde_json::json!({ "removed": removed })))
}

// ============ Error Handling ============

/// Application error type
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };

        let body = Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        let message = err.to_string();
        match err {
            QueueError::NotFound(_) => AppError::NotFound(message),
            QueueError::InvalidUrl { .. } | QueueError::InvalidTransition(_) => {
                AppError::BadRequest(message)
            }
            QueueError::ShuttingDown => AppError::Conflict(message),
        }
    }
}

impl From<crate::Error> for AppError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Queue(e) => e.into(),
            other => {
                warn!("Request failed: {}", other);
                AppError::Internal(other.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        warn!("Request failed: {:#}", err);
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, SharedSettings, ToolSettings};
    use crate::db::History;
    use crate::download::{DownloadExecutor, DownloadQueue, DownloadState, YtDlpInvocation};
    use crate::process::ProcessSupervisor;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use parking_lot::RwLock;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<AppState>) {
        let settings: SharedSettings = Arc::new(RwLock::new(Settings::default()));
        let tools = ToolSettings {
            ytdlp_path: "/nonexistent/media-downloader-test/yt-dlp".into(),
            ..ToolSettings::default()
        };
        let executor = DownloadExecutor::new(
            ProcessSupervisor::new(),
            Arc::new(YtDlpInvocation::new(tools)),
        );
        let queue = DownloadQueue::new(settings.clone(), executor);
        let state = Arc::new(AppState::new(
            settings,
            queue,
            History::open_in_memory().unwrap(),
        ));
        (crate::server::router(state.clone()), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        };
        app.clone().oneshot(request.body(body).unwrap()).await.unwrap()
    }

    async fn json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_and_list() {
        let (app, state) = app();

        let response = call(
            &app,
            "POST",
            "/api/downloads",
            Some(serde_json::json!({ "url": "https://example.com/watch?v=1", "category": "audio" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let added: AddDownloadResponse = json(response).await;

        let response = call(&app, "GET", "/api/downloads", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let items: Vec<DownloadItem> = json(response).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, added.id);
        assert_eq!(
            items[0].output_dir,
            state.settings.read().categories["audio"].destination
        );

        let response = call(&app, "GET", &format!("/api/downloads/{}", added.id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_invalid_urls() {
        let (app, _) = app();
        let response = call(
            &app,
            "POST",
            "/api/downloads",
            Some(serde_json::json!({ "url": "file:///etc/passwd" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = json(response).await;
        assert!(body["error"].as_str().unwrap().contains("unsupported scheme"));
    }

    #[tokio::test]
    async fn unknown_items_are_not_found() {
        let (app, _) = app();
        for (method, uri) in [
            ("POST", "/api/downloads/nope/pause"),
            ("POST", "/api/downloads/nope/resume"),
            ("POST", "/api/downloads/nope/retry"),
            ("POST", "/api/downloads/nope/prioritize"),
            ("DELETE", "/api/downloads/nope"),
            ("GET", "/api/downloads/nope"),
        ] {
            let response = call(&app, method, uri, None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn illegal_transition_is_bad_request() {
        let (app, state) = app();
        let id = state
            .queue
            .submit("https://example.com/v", SubmitOptions::default())
            .unwrap();

        // The tool is missing, so the item fails on its first dispatch.
        let queue = state.queue.clone();
        let watched = id.clone();
        crate::download::testing::wait_until(move || {
            queue.get(&watched).unwrap().state == DownloadState::Failed
        })
        .await;

        let response = call(&app, "POST", &format!("/api/downloads/{id}/resume"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = call(&app, "POST", &format!("/api/downloads/{id}/retry"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn settings_round_trip_clamps_the_ceiling() {
        let (app, state) = app();
        let response = call(
            &app,
            "PUT",
            "/api/settings",
            Some(serde_json::json!({ "max_concurrent": 50, "history_enabled": false })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let updated: SettingsResponse = json(response).await;
        assert_eq!(updated.max_concurrent, 10);
        assert!(!updated.history_enabled);
        assert_eq!(state.queue.concurrency_limit(), 10);

        let response = call(
            &app,
            "PUT",
            "/api/settings",
            Some(serde_json::json!({ "output_template": "/abs/%(id)s" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = call(
            &app,
            "PUT",
            "/api/settings",
            Some(serde_json::json!({ "output_template": "../../x/%(id)s.%(ext)s" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_ne!(
            state.settings.read().downloads.output_template,
            "../../x/%(id)s.%(ext)s"
        );
    }

    #[tokio::test]
    async fn stats_and_history() {
        let (app, _) = app();
        let response = call(&app, "GET", "/api/downloads/stats", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let stats: serde_json::Value = json(response).await;
        assert_eq!(stats["total"], 0);
        assert_eq!(stats["max_concurrent"], 3);

        let response = call(&app, "GET", "/api/processes", None).await;
        let processes: serde_json::Value = json(response).await;
        assert_eq!(processes, serde_json::json!([]));

        let response = call(&app, "GET", "/api/history?limit=5", None).await;
        let records: Vec<HistoryRecord> = json(response).await;
        assert!(records.is_empty());

        let response = call(&app, "DELETE", "/api/history", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
