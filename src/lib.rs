pub mod collector;
pub mod config;
pub mod error;
pub mod github;
pub mod metrics;
pub mod querier;
pub mod retry;
pub mod store;
pub mod transport;
pub mod types;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use config::{AppConfig, RepoId};
use error::{QueryError, StoreError};
use querier::{MetricsQuerier, RepoMetrics};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use types::Repository;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// Shared application state accessible to all request handlers.
pub struct AppState {
    /// Service for querying repository metrics.
    pub querier: MetricsQuerier,
    /// Application configuration loaded from environment variables.
    pub config: AppConfig,
}

impl AppState {
    /// Initializes the application state, including the metrics querier.
    pub fn new(config: AppConfig) -> Self {
        let querier = MetricsQuerier::new(&config);
        Self { querier, config }
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let serve_dir = ServeDir::new("dist").not_found_service(ServeFile::new("dist/index.html"));

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/repos", get(list_repos))
        .route("/api/repos/{owner}/{repo}/metrics", get(get_repo_metrics))
        .route("/api/repos/{owner}/{repo}/metrics/{name}", get(get_repo_metric))
        .fallback_service(serve_dir)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "collabflow",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn list_repos(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Repository>> {
    state.querier.list().await.map(Json).map_err(|e| {
        tracing::error!("Failed to list repositories: {}", e);
        error_response(e)
    })
}

pub async fn get_repo_metrics(
    Path(path): Path<RepoPath>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<RepoMetrics> {
    let repo_id = path.repo_id()?;
    match state.querier.get(repo_id.clone()).await {
        Ok(metrics) => {
            tracing::debug!(repo_id = %repo_id, "Returning metrics");
            Ok(Json(RepoMetrics::clone(&metrics)))
        }
        Err(e) => {
            tracing::error!("Failed to load metrics for {}: {}", repo_id, e);
            Err(error_response(e))
        }
    }
}

pub async fn get_repo_metric(
    Path(path): Path<MetricPath>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<metrics::MetricReport> {
    let repo_id = RepoPath {
        owner: path.owner,
        repo: path.repo,
    }
    .repo_id()?;

    state
        .querier
        .get_metric(repo_id.clone(), &path.name)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to load metric {} for {}: {}", path.name, repo_id, e);
            error_response(e)
        })
}

#[derive(Deserialize)]
pub struct RepoPath {
    owner: String,
    repo: String,
}

impl RepoPath {
    fn repo_id(&self) -> Result<RepoId, (StatusCode, String)> {
        format!("{}/{}", self.owner, self.repo)
            .parse()
            .map_err(|e: config::InvalidRepoId| (StatusCode::BAD_REQUEST, e.to_string()))
    }
}

#[derive(Deserialize)]
pub struct MetricPath {
    owner: String,
    repo: String,
    name: String,
}

fn error_response(e: QueryError) -> (StatusCode, String) {
    match e {
        QueryError::NotCollected(repo_id) => (
            StatusCode::NOT_FOUND,
            format!("Repository {repo_id} has not been collected"),
        ),
        QueryError::UnknownMetric(name) => {
            (StatusCode::NOT_FOUND, format!("Unknown metric '{name}'"))
        }
        QueryError::Store(StoreError::CorruptLocalData { .. }) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Local dataset is corrupt".to_string(),
        ),
        QueryError::Store(_) | QueryError::Task(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        ),
    }
}
