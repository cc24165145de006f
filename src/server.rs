//!
//! echofiles HTTP/WS server
//! ------------------------
//! Axum routes over `filestore::Filestore`, plus a WebSocket feed of listing-stale signals.
//!
//! Responsibilities:
//! - Owner identity from the `x-user-id` header set by the upstream auth proxy.
//! - Correlation ids from `x-request-id` carried into operation logs.
//! - `AppError` bodies with matching statuses for every failure.
//! - Periodic TTL sweeps, one periodic snapshot task, and a final flush on shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::filestore::{
    EffectiveConfig, Filestore, FilestoreConfig, GlobalFilestoreConfig, ListingStale, RequestContext, Scope, StaleReason, View,
};
use crate::storage::SharedStore;

const USER_HEADER: &str = "x-user-id";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub filestore: Filestore,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(r: JsonRejection) -> Self { AppError::user("invalid_body".to_string(), r.body_text()) }
}

impl From<QueryRejection> for AppError {
    fn from(r: QueryRejection) -> Self { AppError::user("invalid_query".to_string(), r.body_text()) }
}

impl From<PathRejection> for AppError {
    fn from(r: PathRejection) -> Self { AppError::user("invalid_path".to_string(), r.body_text()) }
}

/// `Json` whose rejections are `AppError` bodies.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
struct ApiJson<T>(T);

/// `Query` whose rejections are `AppError` bodies.
#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(AppError))]
struct ApiQuery<T>(T);

/// `Path` whose rejections are `AppError` bodies.
#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(AppError))]
struct ApiPath<T>(T);

/// Blank query values (`?parentId=`) mean "not given".
fn blank_as_none<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Uuid>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => Uuid::parse_str(s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub http_port: u16,
    /// `None` keeps everything in memory.
    pub data_root: Option<PathBuf>,
    pub persist: bool,
    pub config_path: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 7878, data_root: Some(PathBuf::from("data")), persist: false, config_path: None }
    }
}

impl ServerSettings {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let http_port = lookup("ECHOFILES_HTTP_PORT").and_then(|s| s.trim().parse().ok()).unwrap_or(d.http_port);
        let data_root = match lookup("ECHOFILES_DATA_ROOT") {
            Some(s) if s.trim().is_empty() || s.trim() == ":memory:" => None,
            Some(s) => Some(PathBuf::from(s.trim())),
            None => d.data_root,
        };
        let persist = lookup("ECHOFILES_PERSIST")
            .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(d.persist);
        let config_path = lookup("ECHOFILES_CONFIG").filter(|s| !s.trim().is_empty()).map(PathBuf::from);
        Self { http_port, data_root, persist, config_path }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Defaults, then the optional JSON file, then `ECHOFILES_*` overrides.
    pub fn effective_config(&self) -> anyhow::Result<EffectiveConfig> {
        let file = match &self.config_path {
            Some(p) => FilestoreConfig::from_json_file(p)?,
            None => FilestoreConfig::default(),
        };
        let merged = file.overlay(FilestoreConfig::from_env());
        Ok(EffectiveConfig::from_layers(&GlobalFilestoreConfig::default(), &merged))
    }
}

/// All HTTP and WebSocket routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "echofiles ok" }))
        .route("/api/files", get(list_files))
        .route("/api/files/counts", get(counts))
        .route("/api/files/upload", post(upload_file))
        .route("/api/files/empty-trash", delete(empty_trash))
        .route("/api/files/{id}", get(get_entry))
        .route("/api/files/{id}/breadcrumbs", get(breadcrumbs))
        .route("/api/files/{id}/star", patch(toggle_star))
        .route("/api/files/{id}/trash", patch(toggle_trash))
        .route("/api/files/{id}/rename", patch(rename_entry))
        .route("/api/files/{id}/move", patch(move_entry))
        .route("/api/files/{id}/delete", delete(delete_entry))
        .route("/api/folders/create", post(create_folder))
        .route("/api/events", get(events))
        .with_state(state)
}

pub async fn run_with_settings(settings: ServerSettings) -> anyhow::Result<()> {
    let config = settings.effective_config().context("While resolving filestore configuration")?;
    info!(
        target: "startup",
        "echofiles config: max_upload_bytes={}, max_depth={}, cascade_trash={}, dedup_ttl_secs={}, allowed_types={:?}",
        config.max_upload_bytes, config.max_depth, config.cascade_trash, config.dedup_ttl_secs, config.allowed_content_types
    );

    let store = match &settings.data_root {
        Some(root) => SharedStore::open(root, settings.persist)
            .with_context(|| format!("While opening data root: {}", root.display()))?,
        None => {
            info!(target: "startup", "no data root configured; entries live in memory only");
            SharedStore::in_memory()
        }
    };
    if let Some(root) = store.root_path() {
        info!(target: "startup", "data root {} (persist={})", root.display(), settings.persist);
    }

    // Background TTL sweeper for dedup tokens
    {
        let store_for_sweep = store.clone();
        tokio::spawn(async move {
            use std::time::Duration;
            loop {
                let removed = store_for_sweep.kv_registry().sweep_all();
                if removed > 0 { debug!(target: "echofiles::store", removed = removed, "kv_sweep"); }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // One periodic snapshot task for the whole registry
    if store.spawn_snapshot_loop().is_some() {
        info!(target: "startup", "periodic snapshots enabled");
    }

    let state = AppState { filestore: Filestore::with_kv_content(store.clone(), config) };
    let app = router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", settings.http_port).parse()?;
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "startup", "shutdown requested");
        })
        .await?;

    let saved = store.kv_registry().save_all().context("While flushing snapshots on shutdown")?;
    info!(target: "startup", "flushed {} stores", saved);
    Ok(())
}

/// Entry point using settings from the environment.
pub async fn run() -> anyhow::Result<()> {
    run_with_settings(ServerSettings::from_env()).await
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|s| !s.is_empty())
}

fn request_ctx(headers: &HeaderMap) -> AppResult<RequestContext> {
    let owner = header_str(headers, USER_HEADER).ok_or_else(|| AppError::auth("missing_identity", "x-user-id header is required"))?;
    Ok(RequestContext::with_request_id(owner, header_str(headers, REQUEST_ID_HEADER)))
}

fn parse_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::user("invalid_id".to_string(), format!("'{}' is not a valid entry id", raw)))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    parent_id: Option<Uuid>,
    #[serde(default)]
    view: Option<String>,
    #[serde(default)]
    flat: Option<bool>,
}

async fn list_files(headers: HeaderMap, State(state): State<AppState>, ApiQuery(q): ApiQuery<ListQuery>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    if let Some(uid) = q.user_id.as_deref() {
        if uid != ctx.owner() {
            return Err(AppError::forbidden("ownership_mismatch", "userId does not match the authenticated user"));
        }
    }
    let view: View = q.view.as_deref().unwrap_or("").parse().map_err(|e: String| AppError::user("invalid_view".to_string(), e))?;
    let scope = if q.flat.unwrap_or(false) { Scope::Flat } else { Scope::Children(q.parent_id) };
    let entries = state.filestore.list_view(&ctx, view, scope)?;
    debug!(target: "echofiles::http", request_id = %ctx.request_id, "list view={:?} scope={:?} -> {}", view, scope, entries.len());
    Ok(Json(entries))
}

async fn counts(headers: HeaderMap, State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    Ok(Json(state.filestore.counts(&ctx)?))
}

async fn get_entry(headers: HeaderMap, State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    Ok(Json(state.filestore.get_entry(&ctx, &parse_id(&id)?)?))
}

async fn breadcrumbs(headers: HeaderMap, State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    Ok(Json(state.filestore.breadcrumbs(&ctx, &parse_id(&id)?)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFolderPayload {
    name: String,
    #[serde(default)]
    parent_id: Option<Uuid>,
    #[serde(default)]
    dedup_token: Option<String>,
}

async fn create_folder(headers: HeaderMap, State(state): State<AppState>, ApiJson(p): ApiJson<CreateFolderPayload>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    let folder = state.filestore.create_folder(&ctx, p.parent_id, &p.name, p.dedup_token.as_deref())?;
    Ok((StatusCode::CREATED, Json(folder)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPayload {
    name: String,
    content_type: String,
    /// File bytes, standard base64.
    content: String,
    #[serde(default)]
    parent_id: Option<Uuid>,
    #[serde(default)]
    dedup_token: Option<String>,
}

async fn upload_file(headers: HeaderMap, State(state): State<AppState>, ApiJson(p): ApiJson<UploadPayload>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(p.content.trim())
        .map_err(|e| AppError::user("invalid_content".to_string(), format!("content is not valid base64: {}", e)))?;
    let entry = state
        .filestore
        .upload_file(&ctx, p.parent_id, &p.name, &bytes, p.content_type.trim(), p.dedup_token.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn toggle_star(headers: HeaderMap, State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    Ok(Json(state.filestore.set_star(&ctx, &parse_id(&id)?)?))
}

async fn toggle_trash(headers: HeaderMap, State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    Ok(Json(state.filestore.set_trash(&ctx, &parse_id(&id)?)?))
}

#[derive(Debug, Deserialize)]
struct RenamePayload {
    name: String,
}

async fn rename_entry(
    headers: HeaderMap,
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiJson(p): ApiJson<RenamePayload>,
) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    Ok(Json(state.filestore.rename_entry(&ctx, &parse_id(&id)?, &p.name)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovePayload {
    #[serde(default)]
    parent_id: Option<Uuid>,
}

async fn move_entry(
    headers: HeaderMap,
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiJson(p): ApiJson<MovePayload>,
) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    Ok(Json(state.filestore.move_entry(&ctx, &parse_id(&id)?, p.parent_id)?))
}

async fn delete_entry(headers: HeaderMap, State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    let removed = state.filestore.delete_permanently(&ctx, &parse_id(&id)?).await?;
    Ok(Json(json!({ "success": true, "deletedCount": removed })))
}

async fn empty_trash(headers: HeaderMap, State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let ctx = request_ctx(&headers)?;
    let removed = state.filestore.empty_trash(&ctx).await?;
    Ok(Json(json!({ "success": true, "deletedCount": removed })))
}

async fn events(headers: HeaderMap, State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let ctx = match request_ctx(&headers) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let feed = state.filestore.feed().clone();
    ws.on_upgrade(move |socket| stream_stale_signals(socket, feed.subscribe(), ctx))
}

/// Forward the caller's `ListingStale` signals until either side closes.
async fn stream_stale_signals(socket: WebSocket, mut rx: tokio::sync::broadcast::Receiver<ListingStale>, ctx: RequestContext) {
    use futures_util::{SinkExt, StreamExt};
    let (mut sink, mut stream) = socket.split();
    info!(target: "echofiles::http", request_id = %ctx.request_id, owner = %ctx.owner(), "events subscriber connected");
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            signal = rx.recv() => {
                let signal = match signal {
                    Ok(s) if s.owner_id == ctx.owner() => s,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        warn!(target: "echofiles::http", request_id = %ctx.request_id, "events subscriber lagged by {}", n);
                        ListingStale { owner_id: ctx.owner().to_string(), reason: StaleReason::Resync, entry_id: None }
                    }
                    Err(RecvError::Closed) => break,
                };
                let text = match serde_json::to_string(&signal) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(target: "echofiles::http", request_id = %ctx.request_id, "events subscriber disconnected");
}
