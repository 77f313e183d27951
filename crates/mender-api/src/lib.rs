//! Webhook receiver and health endpoint.
//!
//! `POST /webhook` takes GitLab issue events (token-verified against the
//! shared secret) and funnels them into the same upsert-and-enqueue path
//! the pollers use. `GET /health` reports liveness plus the queue depth.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use mender_core::config::Config;
use mender_core::issue::{IssueState, IssueUpsert, Source, contains_marker};
use mender_core::job::JobState;
use mender_db::Store;
use mender_runner::sync::ingest_issue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// Shared state for all handlers. The store handle is the same one the
/// daemon's workers use.
pub struct ApiState {
    pub cfg: Arc<Config>,
    pub store: Arc<Store>,
    pub job_tx: mpsc::Sender<String>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(cfg: Arc<Config>, store: Arc<Store>, job_tx: mpsc::Sender<String>) -> Self {
        Self {
            cfg,
            store,
            job_tx,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown token fires, finishing in-flight requests.
pub async fn serve_with_shutdown(
    state: Arc<ApiState>,
    listener: tokio::net::TcpListener,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "webhook server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("webhook server shut down");
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    job_queue_depth: i64,
}

async fn health(State(state): State<Arc<ApiState>>) -> axum::response::Response {
    match state.store.count_jobs_in_state(JobState::Queued) {
        Ok(depth) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                uptime_seconds: state.started_at.elapsed().as_secs(),
                job_queue_depth: depth,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "health: queue depth query failed");
            internal_error()
        }
    }
}

fn internal_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "internal error"})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct GitlabIssueEvent {
    #[serde(default)]
    object_kind: String,
    project: Option<GitlabEventProject>,
    object_attributes: Option<GitlabEventAttributes>,
    #[serde(default)]
    labels: Vec<GitlabEventLabel>,
}

#[derive(Debug, Deserialize)]
struct GitlabEventProject {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct GitlabEventAttributes {
    iid: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct GitlabEventLabel {
    #[serde(default)]
    title: String,
}

async fn webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    let secret = &state.cfg.daemon.webhook_secret;
    let token = headers
        .get("X-Gitlab-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if secret.is_empty() || token != secret {
        tracing::warn!("webhook: signature verification failed");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "invalid signature"})),
        )
            .into_response();
    }

    let event: GitlabIssueEvent = match serde_json::from_str(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "webhook: undecodable payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "invalid payload"})),
            )
                .into_response();
        }
    };

    if event.object_kind != "issue" {
        return ignored("unsupported object_kind");
    }
    let (Some(project), Some(attrs)) = (event.project, event.object_attributes) else {
        return ignored("missing project or attributes");
    };

    // Route to the configured project by GitLab project id.
    let project_id = project.id.to_string();
    let Some(project_cfg) = state.cfg.projects.iter().find(|p| {
        p.gitlab
            .as_ref()
            .is_some_and(|g| g.project_id == project_id)
    }) else {
        return ignored("unknown gitlab project");
    };

    // Never ingest our own output.
    if contains_marker(&attrs.description) {
        return ignored("self-authored issue");
    }

    let mut upsert = IssueUpsert::new(&project_cfg.name, Source::Gitlab, &attrs.iid.to_string());
    upsert.title = attrs.title;
    upsert.body = attrs.description;
    upsert.url = attrs.url;
    upsert.state = if attrs.state == "closed" {
        IssueState::Closed
    } else {
        IssueState::Open
    };
    upsert.labels = event.labels.into_iter().map(|l| l.title).collect();
    upsert.source_updated_at = attrs.updated_at;

    match ingest_issue(
        &state.store,
        &state.job_tx,
        &upsert,
        state.cfg.daemon.max_iterations,
    ) {
        Ok(job_id) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "job_created": job_id.is_some(),
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "webhook: ingest failed");
            internal_error()
        }
    }
}

fn ignored(reason: &str) -> axum::response::Response {
    tracing::debug!(reason, "webhook: event ignored");
    (
        StatusCode::OK,
        Json(serde_json::json!({"status": "ignored"})),
    )
        .into_response()
}
