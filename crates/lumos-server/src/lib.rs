#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-server** – Thin JSON-over-HTTP surface over the kernel.
//!
//! Every route delegates straight into a kernel operation; the only logic
//! here is extraction, the response envelope, and the error-kind → status
//! mapping (200/400/404/413/500). Every hit records user activity with the
//! scheduler before dispatch, which defers background work.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use lumos_gateway::GenerateRequest;
use lumos_kernel::{Kernel, KernelError};
use lumos_registry::BrowseQuery;
use lumos_types::{ErrorKind, OpError};

/// Server-side error wrapper carrying the HTTP mapping.
struct ApiError(OpError);

impl From<KernelError> for ApiError {
    fn from(e: KernelError) -> Self {
        ApiError(e.to_op_error())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({ "ok": false, "error": self.0 });
        (status, Json(body)).into_response()
    }
}

fn ok(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({ "ok": true, "data": data }))
}

fn not_found(what: &str) -> ApiError {
    ApiError(OpError::new(ErrorKind::NotFound, format!("not found: {what}")))
}

/// Build the API router over a booted kernel.
pub fn build_router(kernel: Arc<Kernel>) -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/analyze", post(analyze))
        .route("/api/status", get(status))
        .route("/api/storage/:app_id/:key", get(storage_get).put(storage_set).delete(storage_remove))
        .route("/api/process/build", post(process_build))
        .route("/api/process/launch", post(process_launch))
        .route("/api/process/stop", post(process_stop))
        .route("/api/process/status/:app_id", get(process_status))
        .route("/api/process/logs/:app_id", get(process_logs))
        .route("/api/process/list", get(process_list))
        .route("/api/registry/browse", get(registry_browse))
        .route("/api/registry/search", get(registry_search))
        .route("/api/registry/tags", get(registry_tags))
        .route("/api/registry/stats", get(registry_stats))
        .route("/api/registry/sync", post(registry_sync))
        .route("/api/registry/launch/:hash", post(registry_launch))
        .route("/api/registry/:hash", get(registry_get).delete(registry_delete))
        .route("/api/scheduler/tasks", get(scheduler_tasks))
        .route("/api/scheduler/enable", post(scheduler_enable))
        .route("/api/scheduler/disable", post(scheduler_disable))
        .route("/api/scheduler/run", post(scheduler_run))
        .route("/api/scheduler/history/:id", get(scheduler_history))
        .route("/api/scheduler/pause", post(scheduler_pause))
        .route("/api/scheduler/resume", post(scheduler_resume))
        .route("/api/scheduler/reset", post(scheduler_reset))
        .route("/api/profile", get(profile_get).put(profile_update))
        .route("/api/profile/solidify", post(profile_solidify))
        .route("/api/profile/ephemeral", post(profile_ephemeral))
        .route("/api/profile/snapshot", get(profile_snapshot))
        .layer(middleware::from_fn_with_state(kernel.clone(), record_activity))
        .layer(TraceLayer::new_for_http())
        .with_state(kernel)
}

/// Every API hit counts as user activity before dispatch.
async fn record_activity(
    State(kernel): State<Arc<Kernel>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    kernel.scheduler.record_activity();
    next.run(request).await
}

//─────────────────────────────
//  Generation & analysis
//─────────────────────────────

#[derive(Deserialize)]
struct GenerateBody {
    prompt: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    max_tokens: Option<u32>,
}

async fn generate(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<Value>, ApiError> {
    let request = GenerateRequest {
        force: body.force,
        max_tokens: body.max_tokens,
        ..Default::default()
    };
    let outcome = kernel.create_app(&body.prompt, request).await?;
    Ok(ok(outcome))
}

#[derive(Deserialize)]
struct AnalyzeBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    recipe: Option<String>,
}

async fn analyze(Json(body): Json<AnalyzeBody>) -> Result<Json<Value>, ApiError> {
    let report = match (body.code, body.recipe) {
        (Some(code), _) => lumos_analyzer::analyze(&code),
        (None, Some(recipe)) => lumos_analyzer::analyze_recipe(&recipe),
        (None, None) => {
            return Err(ApiError(OpError::new(
                ErrorKind::Validation,
                "provide code or recipe",
            )))
        }
    };
    Ok(ok(report))
}

async fn status(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    let registry = kernel.registry.stats().await;
    let scheduler = kernel.scheduler.aggregate_stats();
    let models = kernel.monitor.models().await;
    let mode = kernel.profile.mode().await;
    ok(json!({
        "registry": registry,
        "scheduler": scheduler,
        "models": models,
        "mode": mode,
        "wasm_apps": kernel.wasm.list_apps().len(),
    }))
}

//─────────────────────────────
//  Storage
//─────────────────────────────

async fn storage_get(
    State(kernel): State<Arc<Kernel>>,
    Path((app_id, key)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let value = kernel
        .storage
        .get(&app_id, &key)
        .await
        .map_err(KernelError::Storage)?;
    Ok(ok(value))
}

async fn storage_set(
    State(kernel): State<Arc<Kernel>>,
    Path((app_id, key)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    kernel
        .storage
        .set(&app_id, &key, value)
        .await
        .map_err(KernelError::Storage)?;
    Ok(ok(json!(true)))
}

async fn storage_remove(
    State(kernel): State<Arc<Kernel>>,
    Path((app_id, key)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    kernel
        .storage
        .remove(&app_id, &key)
        .await
        .map_err(KernelError::Storage)?;
    Ok(ok(json!(true)))
}

//─────────────────────────────
//  Process apps
//─────────────────────────────

#[derive(Deserialize)]
struct HashBody {
    hash: String,
}

#[derive(Deserialize)]
struct AppIdBody {
    app_id: String,
}

async fn process_build(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<HashBody>,
) -> Result<Json<Value>, ApiError> {
    let image = kernel.build_process(&body.hash).await?;
    Ok(ok(json!({ "image": image })))
}

async fn process_launch(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<HashBody>,
) -> Result<Json<Value>, ApiError> {
    Ok(ok(kernel.launch_process(&body.hash).await?))
}

async fn process_stop(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<AppIdBody>,
) -> Result<Json<Value>, ApiError> {
    kernel.kill_app(&body.app_id).await?;
    Ok(ok(json!(true)))
}

async fn process_status(
    State(kernel): State<Arc<Kernel>>,
    Path(app_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let containers = kernel.containers.as_ref().ok_or_else(|| not_found("container engine"))?;
    let healthy = containers
        .health_check(&app_id)
        .await
        .map_err(KernelError::Container)?;
    Ok(ok(json!({ "healthy": healthy })))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_tail")]
    tail: usize,
}

fn default_tail() -> usize {
    100
}

async fn process_logs(
    State(kernel): State<Arc<Kernel>>,
    Path(app_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let containers = kernel.containers.as_ref().ok_or_else(|| not_found("container engine"))?;
    let logs = containers
        .get_logs(&app_id, query.tail)
        .await
        .map_err(KernelError::Container)?;
    Ok(ok(json!({ "logs": logs })))
}

async fn process_list(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    match &kernel.containers {
        Some(containers) => ok(containers.list().await),
        None => ok(Vec::<Value>::new()),
    }
}

//─────────────────────────────
//  Registry
//─────────────────────────────

async fn registry_browse(
    State(kernel): State<Arc<Kernel>>,
    Query(query): Query<BrowseQuery>,
) -> Json<Value> {
    ok(kernel.registry.browse(query).await)
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

async fn registry_search(
    State(kernel): State<Arc<Kernel>>,
    Query(query): Query<SearchQuery>,
) -> Json<Value> {
    ok(kernel.registry.search(&query.q).await)
}

async fn registry_tags(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    ok(kernel.registry.tags().await)
}

async fn registry_stats(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    ok(kernel.registry.stats().await)
}

async fn registry_sync(State(kernel): State<Arc<Kernel>>) -> Result<Json<Value>, ApiError> {
    let url = kernel
        .config
        .community_url
        .clone()
        .ok_or_else(|| not_found("community endpoint"))?;
    let imported = kernel.registry.sync_community(&url).await;
    Ok(ok(json!({ "imported": imported })))
}

async fn registry_launch(
    State(kernel): State<Arc<Kernel>>,
    Path(hash): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let launches = kernel
        .registry
        .record_launch(&hash)
        .await
        .map_err(KernelError::Registry)?;
    Ok(ok(json!({ "launches": launches })))
}

async fn registry_get(
    State(kernel): State<Arc<Kernel>>,
    Path(hash): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = kernel.registry.get(&hash).await.ok_or_else(|| not_found(&hash))?;
    Ok(ok(entry))
}

async fn registry_delete(
    State(kernel): State<Arc<Kernel>>,
    Path(hash): Path<String>,
) -> Result<Json<Value>, ApiError> {
    kernel
        .registry
        .delete(&hash)
        .await
        .map_err(KernelError::Registry)?;
    Ok(ok(json!(true)))
}

//─────────────────────────────
//  Scheduler
//─────────────────────────────

#[derive(Deserialize)]
struct TaskBody {
    id: String,
    #[serde(default)]
    interval_ms: Option<u64>,
}

async fn scheduler_tasks(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    ok(kernel.scheduler.get_all())
}

async fn scheduler_enable(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<TaskBody>,
) -> Result<Json<Value>, ApiError> {
    kernel
        .scheduler
        .enable(&body.id, body.interval_ms)
        .await
        .map_err(KernelError::Scheduler)?;
    Ok(ok(json!(true)))
}

async fn scheduler_disable(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<TaskBody>,
) -> Result<Json<Value>, ApiError> {
    kernel
        .scheduler
        .disable(&body.id)
        .await
        .map_err(KernelError::Scheduler)?;
    Ok(ok(json!(true)))
}

async fn scheduler_run(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<TaskBody>,
) -> Result<Json<Value>, ApiError> {
    let result = kernel
        .scheduler
        .run_now(&body.id)
        .await
        .map_err(KernelError::Scheduler)?;
    Ok(ok(result))
}

async fn scheduler_history(
    State(kernel): State<Arc<Kernel>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let history = kernel
        .scheduler
        .history(&id)
        .map_err(KernelError::Scheduler)?;
    Ok(ok(history))
}

async fn scheduler_pause(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    kernel.scheduler.pause().await;
    ok(json!(true))
}

async fn scheduler_resume(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    kernel.scheduler.resume().await;
    ok(json!(true))
}

async fn scheduler_reset(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<TaskBody>,
) -> Result<Json<Value>, ApiError> {
    kernel
        .scheduler
        .reset_circuit_breaker(&body.id)
        .await
        .map_err(KernelError::Scheduler)?;
    Ok(ok(json!(true)))
}

//─────────────────────────────
//  Profile / snapshot
//─────────────────────────────

async fn profile_get(State(kernel): State<Arc<Kernel>>) -> Json<Value> {
    ok(kernel.profile.profile().await)
}

async fn profile_update(
    State(kernel): State<Arc<Kernel>>,
    Json(profile): Json<lumos_profile::Profile>,
) -> Result<Json<Value>, ApiError> {
    kernel
        .profile
        .update(profile)
        .await
        .map_err(|e| ApiError(OpError::new(ErrorKind::Internal, e.to_string())))?;
    Ok(ok(json!(true)))
}

async fn profile_solidify(State(kernel): State<Arc<Kernel>>) -> Result<Json<Value>, ApiError> {
    let page = kernel
        .registry
        .browse(BrowseQuery { limit: usize::MAX, ..Default::default() })
        .await;
    let meta = kernel
        .profile
        .solidify(&page.apps, None)
        .await
        .map_err(|e| ApiError(OpError::new(ErrorKind::Internal, e.to_string())))?;
    Ok(ok(meta))
}

#[derive(Deserialize)]
struct EphemeralBody {
    #[serde(default)]
    clear_snapshot: bool,
}

async fn profile_ephemeral(
    State(kernel): State<Arc<Kernel>>,
    Json(body): Json<EphemeralBody>,
) -> Result<Json<Value>, ApiError> {
    kernel
        .profile
        .go_ephemeral(body.clear_snapshot)
        .await
        .map_err(|e| ApiError(OpError::new(ErrorKind::Internal, e.to_string())))?;
    Ok(ok(json!(true)))
}

async fn profile_snapshot(State(kernel): State<Arc<Kernel>>) -> Result<Json<Value>, ApiError> {
    let meta = kernel
        .profile
        .snapshot_meta()
        .await
        .ok_or_else(|| not_found("snapshot"))?;
    Ok(ok(meta))
}
