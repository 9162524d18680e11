//! Service layer for querying and caching repository metrics.
//!
//! This module implements `MetricsQuerier`, which acts as the main entry point for retrieving
//! repository metrics. It handles:
//! 1. Checking the in-memory cache for existing data.
//! 2. Loading the collected dataset from disk if the cache is empty.
//! 3. Running every registered metric over the dataset.

use crate::config::{AppConfig, RepoId};
use crate::error::QueryError;
use crate::metrics::{MetricParams, MetricRegistry, MetricReport};
use crate::store::DatasetStore;
use crate::types::Repository;
use chrono::Duration;
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;

/// All metrics of one repository, computed from a single dataset snapshot.
#[derive(Debug, Serialize, Clone)]
pub struct RepoMetrics {
    pub repository: Repository,
    pub total_prs: usize,
    pub total_events: usize,
    pub metrics: Vec<MetricReport>,
}

#[derive(Clone)]
pub struct MetricsQuerier {
    cache: Cache<RepoId, Arc<RepoMetrics>>,
    store: DatasetStore,
    registry: Arc<MetricRegistry>,
    params: MetricParams,
}

impl MetricsQuerier {
    /// Initializes a new MetricsQuerier over the dataset at `config.data_dir`
    /// with the built-in metrics.
    pub fn new(config: &AppConfig) -> Self {
        Self::with_registry(config, MetricRegistry::with_builtin())
    }

    pub fn with_registry(config: &AppConfig, registry: MetricRegistry) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_max_capacity)
            .time_to_live(config.cache_ttl())
            .build();

        Self {
            cache,
            store: DatasetStore::new(&config.data_dir),
            registry: Arc::new(registry),
            params: MetricParams {
                days_to_display: Duration::days(config.metrics_days_to_display),
                window_size: Duration::days(config.metrics_window_size),
            },
        }
    }

    /// Repositories with a completed collection run.
    pub async fn list(&self) -> Result<Vec<Repository>, QueryError> {
        let store = self.store.clone();
        run_blocking(move || {
            let mut repositories = Vec::new();
            for repo in store.list_repositories()? {
                if let Some(repository) = store.load_repository(&repo)? {
                    repositories.push(repository);
                }
            }
            Ok(repositories)
        })
        .await
    }

    /// Retrieves metrics for a repository, computing them if not cached (read-through).
    pub async fn get(&self, repo_id: RepoId) -> Result<Arc<RepoMetrics>, QueryError> {
        if let Some(metrics) = self.cache.get(&repo_id).await {
            return Ok(metrics);
        }

        let metrics = Arc::new(self.load_and_calculate_metrics(&repo_id).await?);

        self.cache.insert(repo_id, metrics.clone()).await;

        Ok(metrics)
    }

    /// One named metric of a repository.
    pub async fn get_metric(&self, repo_id: RepoId, name: &str) -> Result<MetricReport, QueryError> {
        if !self.registry.names().any(|n| n == name) {
            return Err(QueryError::UnknownMetric(name.to_string()));
        }

        let metrics = self.get(repo_id).await?;
        metrics
            .metrics
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| QueryError::UnknownMetric(name.to_string()))
    }

    /// Drops the cached metrics of a repository, e.g. after a collection run.
    pub async fn invalidate(&self, repo_id: &RepoId) {
        self.cache.invalidate(repo_id).await;
    }

    /// Loads the dataset from disk and runs every registered metric over it.
    async fn load_and_calculate_metrics(&self, repo_id: &RepoId) -> Result<RepoMetrics, QueryError> {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let params = self.params;
        let repo_id = repo_id.clone();

        run_blocking(move || {
            let dataset = store.load_dataset(&repo_id)?;
            let Some(repository) = dataset.repository.clone() else {
                return Err(QueryError::NotCollected(repo_id));
            };

            let metrics = registry.compute_all(&dataset, &params);
            tracing::debug!(
                repo_id = %repo_id,
                prs = dataset.pull_requests.len(),
                events = dataset.events.len(),
                "Calculated metrics"
            );

            Ok(RepoMetrics {
                repository,
                total_prs: dataset.pull_requests.len(),
                total_events: dataset.events.len(),
                metrics,
            })
        })
        .await
    }
}

/// Runs file-reading work off the async executor.
async fn run_blocking<T, F>(work: F) -> Result<T, QueryError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, QueryError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| QueryError::Task(e.to_string()))?
}
