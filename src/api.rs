//! External HTTP contracts.
//!
//! The authenticating frontend layer terminates sessions upstream and
//! forwards the caller's identity in the `x-user-id` header; handlers here
//! only delegate to the orchestrator, the command gateway, and the entity
//! store, and map the error taxonomy onto status codes. The
//! `/api/routes/:subdomain` lookup is the contract the reverse proxy
//! consumes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::errors::DeployError;
use crate::gateway::CommandGateway;
use crate::orchestrator::Orchestrator;
use crate::store::DbHandle;
use crate::store::models::{Deployment, Framework, Project};

/// Deployments included in a project detail response.
const RECENT_DEPLOYMENTS: i64 = 5;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<CommandGateway>,
    pub container_prefix: String,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub repo_url: String,
    pub framework: Framework,
    pub branch: Option<String>,
}

#[derive(Deserialize)]
pub struct TerminalRequest {
    pub command: String,
}

#[derive(Serialize)]
pub struct DeployResponse {
    pub deployment_id: i64,
    pub message: String,
}

#[derive(Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub deployments: Vec<Deployment>,
}

#[derive(Serialize)]
pub struct RouteTarget {
    pub host_port: u16,
    pub target: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let status = match &err {
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::Validation(_) | DeployError::Timeout { .. } => StatusCode::BAD_REQUEST,
            DeployError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal failures keep their detail in the logs, not the body.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "request failed");
            "internal error".to_string()
        } else {
            err.to_string()
        };
        ApiError { status, message }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", post(create_project))
        .route("/api/projects/:id", get(get_project).delete(delete_project))
        .route("/api/projects/:id/deploy", post(deploy_project))
        .route("/api/projects/:id/terminal", post(run_terminal_command))
        .route("/api/routes/:subdomain", get(resolve_route))
        .route("/health", get(health_check))
}

pub fn build_router(state: SharedState) -> Router {
    api_router().layer(CorsLayer::permissive()).with_state(state)
}

/// Start the API server. The authenticating layer proxies to loopback.
pub async fn start_server(state: SharedState, port: u16) -> anyhow::Result<()> {
    use anyhow::Context;

    let app = build_router(state);
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(%addr, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    info!("API shut down");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            // With no signal listener the server cannot shut down cleanly;
            // pending here keeps it serving until the process is killed.
            tracing::error!(error = %e, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Identity injected by the upstream authenticating layer.
fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError::from(DeployError::Unauthorized))
}

/// Derive the URL-safe slug for a display name: lowercased ASCII
/// alphanumerics, with a single dash standing in for each run of anything
/// else, capped at `max_len`. The slug doubles as the subdomain and the
/// container name root, so it must be a valid DNS label.
pub fn slugify(name: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(max_len);
    for c in name.chars() {
        if slug.len() == max_len {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller(&headers)?;
    if req.name.trim().is_empty() {
        return Err(DeployError::Validation("project name must not be empty".into()).into());
    }
    let slug = slugify(&req.name, 40);
    if slug.is_empty() {
        return Err(DeployError::Validation(
            "project name must contain at least one alphanumeric character".into(),
        )
        .into());
    }

    let branch = req.branch.filter(|b| !b.is_empty()).unwrap_or_else(|| "main".to_string());
    let project = state
        .db
        .call(move |db| {
            db.create_project(&user_id, &req.name, &slug, &req.repo_url, req.framework, &branch)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller(&headers)?;
    let project = state
        .db
        .call(move |db| db.get_project_for_user(id, &user_id))
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("project {} not found", id)))?;
    let deployments = state
        .db
        .call(move |db| db.recent_deployments(id, RECENT_DEPLOYMENTS))
        .await?;
    Ok(Json(ProjectDetail {
        project,
        deployments,
    }))
}

async fn delete_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller(&headers)?;
    state.orchestrator.teardown_project(id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deploy_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller(&headers)?;
    let deployment = state.orchestrator.create_deployment(id, &user_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            deployment_id: deployment.id,
            message: "deployment queued".to_string(),
        }),
    ))
}

async fn run_terminal_command(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<TerminalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller(&headers)?;
    if req.command.is_empty() || req.command.len() > 1000 {
        return Err(
            DeployError::Validation("command must be between 1 and 1000 characters".into()).into(),
        );
    }

    let project = state
        .db
        .call(move |db| db.get_project_for_user(id, &user_id))
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("project {} not found", id)))?;

    // Commands only make sense against the live container of a deployed
    // project.
    let latest = state.db.call(move |db| db.latest_deployment(id)).await?;
    let deployed = latest
        .map(|d| d.status == crate::store::models::DeploymentStatus::Deployed)
        .unwrap_or(false);
    if !deployed {
        return Err(DeployError::Validation(
            "project has no running deployment; deploy it first".into(),
        )
        .into());
    }

    let container_name = project.container_name(&state.container_prefix);
    let outcome = state.gateway.run(&container_name, &req.command).await?;
    Ok(Json(outcome))
}

async fn resolve_route(
    State(state): State<SharedState>,
    Path(subdomain): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = subdomain.clone();
    let host_port = state
        .db
        .call(move |db| db.resolve_subdomain(&sub))
        .await?
        .ok_or_else(|| {
            DeployError::NotFound(format!("no deployment serves subdomain '{}'", subdomain))
        })?;
    Ok(Json(RouteTarget {
        host_port,
        target: format!("127.0.0.1:{}", host_port),
    }))
}
