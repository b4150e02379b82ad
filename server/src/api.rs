//! HTTP API and WebSocket event fan-out.
//!
//! JSON endpoints mirror the operation set: ingestion control, retrieval,
//! job inspection, project stats/clear, and scope detection. Queries never
//! surface partial failure as an HTTP error — degradations ride in the
//! response metadata. `/ws` streams bus events filtered by project and
//! topic list.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use atoll_core::autoscope::AutoScopeConfig;
use atoll_core::hash::sha256_hex;
use atoll_core::scope::{
    resolve_crawl, resolve_local, resolve_remote_repo, ResolvedScope, ScopeOverride,
};
use atoll_core::types::{
    CrawlMode, DatasetScope, JobKind, JobState, QueryRequest, QueryResponse,
};

use crate::bus::SubscriptionFilter;
use crate::crawl::CrawlPayload;
use crate::error::Error;
use crate::ingest::{LocalIngestPayload, RemoteRepoPayload};
use crate::state::AppContext;

// ---------------------------------------------------------------------------
// Axum state and error mapping
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<AppContext>,
    pub start_time: Instant,
}

/// JSON error body with the structured code from the taxonomy.
pub struct ApiError(StatusCode, String, &'static str);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::InvalidInput(_) | Error::Scope(_) => StatusCode::BAD_REQUEST,
            Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::SsrfBlocked(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string(), e.code())
    }
}

impl From<atoll_core::scope::ScopeError> for ApiError {
    fn from(e: atoll_core::scope::ScopeError) -> Self {
        ApiError::from(Error::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.1, "code": self.2 }));
        (self.0, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/api/ingest/local", post(api_ingest_local))
        .route("/api/ingest/repo", post(api_ingest_repo))
        .route("/api/ingest/crawl", post(api_ingest_crawl))
        .route("/api/query", post(api_query))
        .route("/api/jobs", get(api_jobs_list))
        .route("/api/jobs/{id}", get(api_jobs_get))
        .route("/api/jobs/{id}/cancel", post(api_jobs_cancel))
        .route("/api/projects/{project}/stats", get(api_project_stats))
        .route("/api/projects/{project}/clear", post(api_project_clear))
        .route("/api/scope/detect", post(api_scope_detect))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn api_health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Scope helpers
// ---------------------------------------------------------------------------

/// Resolve scope for a local path: explicit caller values win, then the
/// auto-scope file's overrides, then deterministic detection (with the
/// store-backed collision check). Ensures the project and dataset rows
/// exist and returns `(scope, dataset_id)`.
pub fn resolve_and_ensure_local(
    ctx: &Arc<AppContext>,
    path: &Path,
    project: Option<String>,
    dataset: Option<String>,
) -> Result<(ResolvedScope, String), Error> {
    let canonical = path
        .canonicalize()
        .map_err(|_| Error::InvalidInput(format!("path does not exist: {}", path.display())))?;
    let locator = canonical.to_string_lossy().to_string();
    let locator_hash = sha256_hex(locator.as_bytes());

    let mut over = ScopeOverride { project, dataset };
    let mut autoscope = load_autoscope(ctx);
    if let Some(cfg) = &autoscope {
        let from_file = cfg.override_for(&locator);
        over.project = over.project.or(from_file.project);
        over.dataset = over.dataset.or(from_file.dataset);
    }

    let meta = ctx.meta.clone();
    let hash = locator_hash.clone();
    let scope = resolve_local(path, &over, &move |id: &str| {
        meta.project_locator_collides(id, &hash)
    })?;

    ctx.meta.get_or_create_project(&scope.project_id, &scope.project_id, Some(&locator_hash))?;
    let ds = ctx.meta.get_or_create_dataset(
        &scope.project_id,
        &scope.dataset,
        DatasetScope::Local,
    )?;

    if let Some(cfg) = &mut autoscope {
        cfg.record(&locator, &scope.project_id, &scope.dataset);
        save_autoscope(cfg);
    }
    Ok((scope, ds.id))
}

fn load_autoscope(ctx: &Arc<AppContext>) -> Option<AutoScopeConfig> {
    if !ctx.config.auto_scope_enabled {
        return None;
    }
    let path = AutoScopeConfig::default_path()?;
    match AutoScopeConfig::load(&path) {
        Ok(cfg) if cfg.enabled => Some(cfg),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "could not read auto-scope config");
            None
        }
    }
}

fn save_autoscope(cfg: &AutoScopeConfig) {
    if !cfg.auto_save {
        return;
    }
    if let Some(path) = AutoScopeConfig::default_path() {
        if let Err(e) = cfg.save(&path) {
            warn!(error = %e, "could not save auto-scope config");
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion control
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct IngestLocalRequest {
    path: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct EnqueueResponse {
    job_id: String,
    state: JobState,
    created: bool,
    project: String,
    dataset: String,
}

async fn api_ingest_local(
    State(state): State<ApiState>,
    Json(req): Json<IngestLocalRequest>,
) -> ApiResult<EnqueueResponse> {
    let ctx = &state.ctx;
    let path = PathBuf::from(&req.path);
    let (scope, dataset_id) =
        resolve_and_ensure_local(ctx, &path, req.project.clone(), req.dataset.clone())?;

    let payload = LocalIngestPayload { path: req.path.clone(), force: req.force };
    let fingerprint = &sha256_hex(req.path.as_bytes())[..16];
    let dedup_key = format!(
        "ingest_local:{}:{}:{fingerprint}",
        scope.project_id, dataset_id
    );
    let (job, created) = ctx.jobs.enqueue(
        JobKind::IngestLocal,
        &scope.project_id,
        &dataset_id,
        &dedup_key,
        serde_json::to_value(&payload).map_err(Error::from)?,
    )?;
    info!(job = %job.id, project = %scope.project_id, created, "ingest.local accepted");
    Ok(Json(EnqueueResponse {
        job_id: job.id,
        state: job.state,
        created,
        project: scope.project_id,
        dataset: scope.dataset,
    }))
}

#[derive(Deserialize)]
struct IngestRepoRequest {
    repo: String,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn api_ingest_repo(
    State(state): State<ApiState>,
    Json(req): Json<IngestRepoRequest>,
) -> ApiResult<EnqueueResponse> {
    let ctx = &state.ctx;
    let over = ScopeOverride { project: req.project.clone(), dataset: req.dataset.clone() };
    let locator_hash = sha256_hex(req.repo.trim().to_lowercase().as_bytes());
    let meta = ctx.meta.clone();
    let hash = locator_hash.clone();
    let scope = resolve_remote_repo(&req.repo, &over, &move |id: &str| {
        meta.project_locator_collides(id, &hash)
    })?;

    ctx.meta.get_or_create_project(&scope.project_id, &scope.project_id, Some(&locator_hash))?;
    let ds = ctx.meta.get_or_create_dataset(
        &scope.project_id,
        &scope.dataset,
        DatasetScope::Project,
    )?;

    let payload = RemoteRepoPayload {
        repo: req.repo.clone(),
        branch: req.branch.clone(),
        sha: req.sha.clone(),
        force: req.force,
    };
    let fingerprint = &sha256_hex(
        format!("{}@{}", req.repo, req.sha.as_deref().or(req.branch.as_deref()).unwrap_or("HEAD"))
            .as_bytes(),
    )[..16];
    let dedup_key =
        format!("ingest_remote_repo:{}:{}:{fingerprint}", scope.project_id, ds.id);
    let (job, created) = ctx.jobs.enqueue(
        JobKind::IngestRemoteRepo,
        &scope.project_id,
        &ds.id,
        &dedup_key,
        serde_json::to_value(&payload).map_err(Error::from)?,
    )?;
    Ok(Json(EnqueueResponse {
        job_id: job.id,
        state: job.state,
        created,
        project: scope.project_id,
        dataset: scope.dataset,
    }))
}

#[derive(Deserialize)]
struct IngestCrawlRequest {
    seed_url: String,
    #[serde(default)]
    mode: Option<CrawlMode>,
    #[serde(default)]
    max_pages: Option<usize>,
    #[serde(default)]
    max_depth: Option<usize>,
    #[serde(default)]
    same_domain: Option<bool>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn api_ingest_crawl(
    State(state): State<ApiState>,
    Json(req): Json<IngestCrawlRequest>,
) -> ApiResult<EnqueueResponse> {
    let ctx = &state.ctx;
    let over = ScopeOverride { project: req.project.clone(), dataset: req.dataset.clone() };
    let locator_hash = sha256_hex(req.seed_url.trim().to_lowercase().as_bytes());
    let meta = ctx.meta.clone();
    let hash = locator_hash.clone();
    let scope = resolve_crawl(&req.seed_url, &over, &move |id: &str| {
        meta.project_locator_collides(id, &hash)
    })?;

    ctx.meta.get_or_create_project(&scope.project_id, &scope.project_id, Some(&locator_hash))?;
    let ds = ctx.meta.get_or_create_dataset(
        &scope.project_id,
        &scope.dataset,
        DatasetScope::Project,
    )?;

    let payload = CrawlPayload {
        seed_url: req.seed_url.clone(),
        mode: req.mode.unwrap_or(CrawlMode::Recursive),
        max_pages: req.max_pages.unwrap_or(100),
        max_depth: req.max_depth.unwrap_or(3),
        same_domain: req.same_domain.unwrap_or(true),
        allow: None,
        deny: None,
        force: req.force,
    };
    let fingerprint = &sha256_hex(req.seed_url.as_bytes())[..16];
    let dedup_key = format!("crawl:{}:{}:{fingerprint}", scope.project_id, ds.id);
    let (job, created) = ctx.jobs.enqueue(
        JobKind::Crawl,
        &scope.project_id,
        &ds.id,
        &dedup_key,
        serde_json::to_value(&payload).map_err(Error::from)?,
    )?;
    Ok(Json(EnqueueResponse {
        job_id: job.id,
        state: job.state,
        created,
        project: scope.project_id,
        dataset: scope.dataset,
    }))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

async fn api_query(
    State(state): State<ApiState>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<QueryResponse> {
    let response = crate::retrieve::run_query(&state.ctx, req).await?;
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct JobsListQuery {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    state: Option<JobState>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn api_jobs_list(
    State(state): State<ApiState>,
    Query(q): Query<JobsListQuery>,
) -> ApiResult<Vec<atoll_core::types::Job>> {
    let jobs = state.ctx.jobs.list(q.project.as_deref(), q.state, q.limit.unwrap_or(50))?;
    Ok(Json(jobs))
}

async fn api_jobs_get(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<atoll_core::types::Job> {
    Ok(Json(state.ctx.jobs.get(&id)?))
}

async fn api_jobs_cancel(
    State(state): State<ApiState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<atoll_core::types::Job> {
    Ok(Json(state.ctx.jobs.cancel(&id)?))
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

async fn api_project_stats(
    State(state): State<ApiState>,
    AxumPath(project): AxumPath<String>,
) -> ApiResult<atoll_core::types::ProjectStats> {
    Ok(Json(state.ctx.meta.project_stats(&project)?))
}

#[derive(Deserialize)]
struct ClearRequest {
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

async fn api_project_clear(
    State(state): State<ApiState>,
    AxumPath(project): AxumPath<String>,
    Json(req): Json<ClearRequest>,
) -> ApiResult<crate::meta::ClearSummary> {
    let ctx = &state.ctx;
    let summary = ctx.meta.clear_project(&project, req.dataset.as_deref(), req.dry_run)?;
    if !req.dry_run {
        for collection in &summary.collections {
            if let Err(e) = ctx.vectors.delete_collection(collection).await {
                warn!(collection = collection.as_str(), error = %e, "could not drop collection");
            }
        }
        info!(project = project.as_str(), chunks = summary.chunks, "project cleared");
    }
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------
// Scope detection
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ScopeDetectRequest {
    locator: String,
    /// `local`, `repo`, or `crawl`.
    source_type: String,
}

async fn api_scope_detect(
    State(_state): State<ApiState>,
    Json(req): Json<ScopeDetectRequest>,
) -> ApiResult<ResolvedScope> {
    let over = ScopeOverride::default();
    let no_collision = |_: &str| false;
    let scope = match req.source_type.as_str() {
        "local" => resolve_local(Path::new(&req.locator), &over, &no_collision)?,
        "repo" => resolve_remote_repo(&req.locator, &over, &no_collision)?,
        "crawl" => resolve_crawl(&req.locator, &over, &no_collision)?,
        other => {
            return Err(
                Error::InvalidInput(format!("unknown source_type {other}")).into()
            )
        }
    };
    Ok(Json(scope))
}

// ---------------------------------------------------------------------------
// WebSocket fan-out
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default)]
    project: Option<String>,
    /// Comma-separated topic list; empty means everything.
    #[serde(default)]
    topics: Option<String>,
}

async fn ws_upgrade(
    State(state): State<ApiState>,
    Query(q): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let filter = SubscriptionFilter {
        project: q.project,
        topics: q
            .topics
            .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default(),
    };
    upgrade.on_upgrade(move |socket| ws_pump(socket, state, filter))
}

/// Forward matching bus events until either side hangs up.
async fn ws_pump(mut socket: WebSocket, state: ApiState, filter: SubscriptionFilter) {
    let mut subscription = state.ctx.bus.subscribe(filter);
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    // Clients only ping; any close/error ends the pump.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
