use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post, put},
    Router,
};
use depbot_core::{
    git::{is_protected_branch, Git},
    JobSpec, NonBreakingRequest, Repository, SecurityPatchResult, SecurityRequest, UpdateRequest,
    Vulnerability,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request types ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct PathQuery {
    pub path: String,
}

#[derive(Deserialize)]
pub(crate) struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub(crate) struct AddRepoBody {
    pub path: String,
}

#[derive(Deserialize)]
pub(crate) struct UpdateBody {
    pub repo_path: String,
    #[serde(flatten)]
    pub request: UpdateRequest,
}

#[derive(Deserialize)]
pub(crate) struct NonBreakingBody {
    pub repo_path: String,
    #[serde(flatten)]
    pub request: NonBreakingRequest,
}

#[derive(Deserialize)]
pub(crate) struct SecurityBody {
    pub repo_path: String,
    #[serde(flatten)]
    pub request: SecurityRequest,
}

#[derive(Deserialize)]
pub(crate) struct SmartBody {
    pub repo_path: String,
    pub repo_name: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────────

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Repositories
        .route("/api/repos", get(list_repos).post(add_repo).delete(remove_repo))
        .route("/api/repos/prune", post(prune_repos))
        .route("/api/repos/outdated", get(repo_outdated))
        .route("/api/repos/status", get(repo_status))
        // Pipeline runs
        .route("/api/pipeline/update", post(run_update))
        .route("/api/pipeline/non-breaking", post(run_non_breaking))
        .route("/api/pipeline/security", post(run_security))
        // Scheduled jobs
        .route("/api/jobs", get(list_jobs).post(add_job))
        .route("/api/jobs/results", get(job_results))
        .route("/api/jobs/:id", put(update_job).delete(delete_job))
        // Smart scans
        .route("/api/smart", get(list_smart).post(add_smart).delete(remove_smart))
        .route("/api/smart/refresh", put(refresh_smart))
        // Streams
        .route("/api/events", get(sse_events))
        .route("/api/logs", get(sse_logs))
        // Settings
        .route("/api/settings", get(get_settings).put(put_settings))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

// Repositories

pub(crate) async fn list_repos(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let repos = state.db.list_repos().map_err(internal)?;
    Ok(Json(json!(repos)))
}

pub(crate) async fn add_repo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddRepoBody>,
) -> Result<Json<Value>, StatusCode> {
    let path = body.path.trim().trim_end_matches('/');
    if path.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let repo = Repository::inspect(path);
    if !repo.exists {
        return Err(StatusCode::NOT_FOUND);
    }
    state.db.upsert_repo(&repo).map_err(internal)?;
    info!("imported repository {} ({:?})", repo.path, repo.ecosystems);
    Ok(Json(json!(repo)))
}

pub(crate) async fn remove_repo(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, StatusCode> {
    let removed = state.db.remove_repo(&q.path).map_err(internal)?;
    if !removed {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "removed": q.path })))
}

pub(crate) async fn prune_repos(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let removed = state.db.prune_repos().map_err(internal)?;
    if !removed.is_empty() {
        info!("pruned {} missing repositories", removed.len());
    }
    Ok(Json(json!({ "removed": removed })))
}

pub(crate) async fn repo_outdated(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, StatusCode> {
    let dir = FsPath::new(&q.path);
    if !dir.is_dir() {
        return Err(StatusCode::NOT_FOUND);
    }
    let mut packages = BTreeMap::new();
    let mut errors = BTreeMap::new();
    for adapter in state.registry.detect(dir) {
        let kind = adapter.kind();
        match adapter.list_outdated(dir).await {
            Ok(list) => {
                packages.insert(kind, list);
            }
            Err(e) => {
                warn!("listing outdated {kind} packages in {} failed: {e:#}", q.path);
                errors.insert(kind, format!("{e:#}"));
            }
        }
    }
    Ok(Json(json!({ "packages": packages, "errors": errors })))
}

pub(crate) async fn repo_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, StatusCode> {
    let dir = FsPath::new(&q.path);
    if !dir.is_dir() {
        return Err(StatusCode::NOT_FOUND);
    }
    let settings = state.pipeline.settings();
    let git = Git::new(dir).with_limits(settings.probe_limits(), settings.push_limits());
    if !git.is_repo().await {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let branch = git.current_branch(dir).await.ok();
    let default_branch = git.default_branch().await.ok();
    let dirty = git.is_dirty(dir).await.ok();
    let (ahead, behind) = match git.ahead_behind(dir).await {
        Ok(Some((a, b))) => (Some(a), Some(b)),
        _ => (None, None),
    };
    let conflicts = if git.has_remote("origin").await {
        match git
            .predict_merge_conflicts(settings.conflict_threshold, settings.conflict_high_threshold)
            .await
        {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("conflict prediction for {} failed: {e:#}", q.path);
                None
            }
        }
    } else {
        None
    };

    Ok(Json(json!({
        "path": q.path,
        "branch": branch,
        "default_branch": default_branch,
        "protected": branch.as_deref().is_some_and(is_protected_branch),
        "dirty": dirty,
        "ahead": ahead,
        "behind": behind,
        "busy": state.pipeline.is_busy(dir),
        "conflicts": conflicts,
    })))
}

// Pipeline runs

pub(crate) async fn run_update(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateBody>,
) -> Json<Value> {
    let result = state
        .pipeline
        .run_update(FsPath::new(&body.repo_path), body.request)
        .await;
    Json(json!(result))
}

pub(crate) async fn run_non_breaking(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NonBreakingBody>,
) -> Json<Value> {
    let result = state
        .pipeline
        .run_non_breaking(FsPath::new(&body.repo_path), body.request)
        .await;
    Json(json!(result))
}

/// Audit the repository with every source matching a detected ecosystem,
/// then patch what the audit found.
pub(crate) async fn run_security(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SecurityBody>,
) -> Json<Value> {
    let dir = FsPath::new(&body.repo_path);
    let detected: Vec<_> = state.registry.detect(dir).iter().map(|a| a.kind()).collect();
    let mut vulnerabilities: Vec<Vulnerability> = Vec::new();
    for audit in &state.audits {
        let kind = audit.ecosystem();
        if !detected.contains(&kind) || body.request.ecosystem.is_some_and(|e| e != kind) {
            continue;
        }
        match audit.audit(dir).await {
            Ok(found) => vulnerabilities.extend(found),
            Err(e) => {
                warn!("{kind} audit of {} failed: {e:#}", body.repo_path);
                return Json(json!(SecurityPatchResult {
                    error: Some(format!("{kind} audit failed: {e:#}")),
                    ..Default::default()
                }));
            }
        }
    }
    let result = state
        .pipeline
        .run_security_patch(dir, vulnerabilities, body.request)
        .await;
    Json(json!(result))
}

// Scheduled jobs

pub(crate) async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let jobs = state.scheduler.jobs().map_err(internal)?;
    Ok(Json(json!(jobs)))
}

pub(crate) async fn add_job(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<JobSpec>,
) -> Result<Json<Value>, StatusCode> {
    if spec.repo_path.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let job = state.scheduler.add_job(spec).map_err(internal)?;
    Ok(Json(json!(job)))
}

pub(crate) async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(spec): Json<JobSpec>,
) -> Result<Json<Value>, StatusCode> {
    match state.scheduler.update_job(&id, spec).map_err(internal)? {
        Some(job) => Ok(Json(json!(job))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub(crate) async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if !state.scheduler.delete_job(&id).map_err(internal)? {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "deleted": id })))
}

pub(crate) async fn job_results(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, StatusCode> {
    let results = state.scheduler.results(q.limit.unwrap_or(50)).map_err(internal)?;
    Ok(Json(json!(results)))
}

// Smart scans

pub(crate) async fn list_smart(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let schedules = state.smart.schedules().map_err(internal)?;
    Ok(Json(json!(schedules)))
}

pub(crate) async fn add_smart(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SmartBody>,
) -> Result<Json<Value>, StatusCode> {
    if body.repo_path.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let schedule = state
        .smart
        .add_schedule(&body.repo_path, body.repo_name)
        .await
        .map_err(internal)?;
    Ok(Json(json!(schedule)))
}

pub(crate) async fn refresh_smart(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, StatusCode> {
    match state.smart.refresh(&q.path).await.map_err(internal)? {
        Some(schedule) => Ok(Json(json!(schedule))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub(crate) async fn remove_smart(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, StatusCode> {
    if !state.smart.remove_schedule(&q.path).map_err(internal)? {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "removed": q.path })))
}

// SSE

pub(crate) async fn sse_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(data) => Some(Ok(Event::default().data(data))),
        _ => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

/// Replays the ring buffer, then streams live log lines.
pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting the ring so nothing falls in between.
    let mut live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx).map(|data| Ok::<_, Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

// Settings

/// Current values as stored in the DB, numbers as JSON numbers.
pub(crate) async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    let current = state.config.load_from_db(&state.db);
    let mut obj = serde_json::Map::new();
    for (key, value) in current.entries() {
        let v = value.parse::<u64>().map(|n| json!(n)).unwrap_or_else(|_| json!(value));
        obj.insert(key.to_string(), v);
    }
    Json(Value::Object(obj))
}

/// Persist known keys. Values take effect on the next start.
pub(crate) async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let map = body.as_object().ok_or(StatusCode::BAD_REQUEST)?;
    let mut updated = 0usize;
    for (key, val) in map {
        if !state.config.is_setting_key(key) {
            continue;
        }
        let s = match val {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        state.db.set_config(key, &s).map_err(internal)?;
        updated += 1;
    }
    Ok(Json(json!({ "updated": updated, "restart_required": updated > 0 })))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use depbot_core::{config::Config, db::Db, exec::Limits, pr_host::GhCli};
    use tower::ServiceExt;

    use super::*;

    fn state() -> Arc<AppState> {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let config = Config::default();
        config.seed_db(&db).unwrap();
        let (log_tx, _) = broadcast::channel(16);
        let pr_host = Arc::new(GhCli::new("depbot-missing-gh", Limits::secs(5), Limits::secs(5)));
        AppState::build(config, db, pr_host, log_tx, Arc::new(Mutex::new(VecDeque::new())))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let req = match body {
            Some(b) => req.body(Body::from(b.to_string())).unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(state());
        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn repos_import_list_and_prune() {
        let app = router(state());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let path = dir.path().to_str().unwrap().to_string();

        let (status, repo) = call(&app, Method::POST, "/api/repos", Some(json!({ "path": path }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(repo["ecosystems"], json!(["node"]));
        assert_eq!(repo["has_git"], false);

        let (_, list) = call(&app, Method::GET, "/api/repos", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, Method::POST, "/api/repos", Some(json!({ "path": "/nonexistent/depbot" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        drop(dir);
        let (_, pruned) = call(&app, Method::POST, "/api/repos/prune", None).await;
        assert_eq!(pruned["removed"], json!([path]));
        let (_, list) = call(&app, Method::GET, "/api/repos", None).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn jobs_crud() {
        let app = router(state());
        let spec = json!({ "repo_path": "/srv/shop", "frequency": "weekly", "run_tests": true });
        let (status, job) = call(&app, Method::POST, "/api/jobs", Some(spec.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["repo_name"], "shop");
        assert_eq!(job["frequency"], "weekly");
        let id = job["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, Method::PUT, "/api/jobs/job-missing", Some(spec.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let edited = json!({ "repo_path": "/srv/shop", "frequency": "daily", "enabled": false });
        let (status, job) = call(&app, Method::PUT, &format!("/api/jobs/{id}"), Some(edited)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["enabled"], false);

        let (_, results) = call(&app, Method::GET, "/api/jobs/results?limit=5", None).await;
        assert_eq!(results, json!([]));

        let (status, _) = call(&app, Method::DELETE, &format!("/api/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, jobs) = call(&app, Method::GET, "/api/jobs", None).await;
        assert_eq!(jobs, json!([]));
    }

    #[tokio::test]
    async fn settings_persist_known_keys_only() {
        let app = router(state());
        let body = json!({ "test_timeout_s": 42, "branch_prefix": "bump/", "not_a_key": 1 });
        let (status, out) = call(&app, Method::PUT, "/api/settings", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out["updated"], 2);

        let (_, settings) = call(&app, Method::GET, "/api/settings", None).await;
        assert_eq!(settings["test_timeout_s"], 42);
        assert_eq!(settings["branch_prefix"], "bump/");
        assert!(settings.get("not_a_key").is_none());
    }

    #[tokio::test]
    async fn update_outside_git_reports_failure() {
        let app = router(state());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let body = json!({
            "repo_path": dir.path().to_str().unwrap(),
            "targets": [{ "name": "left-pad", "ecosystem": "node" }],
        });
        let (status, result) = call(&app, Method::POST, "/api/pipeline/update", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("not a git repository"));
    }

    #[tokio::test]
    async fn smart_refresh_of_unknown_repo_is_not_found() {
        let app = router(state());
        let (status, _) = call(&app, Method::PUT, "/api/smart/refresh?path=/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::DELETE, "/api/smart?path=/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
