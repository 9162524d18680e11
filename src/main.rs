use anyhow::Context;
use clap::{Parser, Subcommand};
use collabflow::collector::Collector;
use collabflow::config::{AppConfig, RepoId};
use collabflow::github::GitHubClient;
use collabflow::querier::MetricsQuerier;
use collabflow::store::DatasetStore;
use collabflow::{create_app, AppState};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Collects GitHub pull request activity into a local CSV dataset and serves
/// collaboration metrics computed from it.
#[derive(Parser, Debug)]
#[command(name = "collabflow", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch new and updated pull requests of a repository into the dataset.
    Collect {
        /// `owner/repo` or a github.com URL.
        repo: RepoId,
        /// Maximum number of pull requests to hold for this repository.
        #[arg(short = 'n', long)]
        num_prs: Option<usize>,
    },
    /// Print the metrics of a collected repository as JSON.
    Report {
        repo: RepoId,
        /// Print only this metric.
        #[arg(long)]
        metric: Option<String>,
    },
    /// List repositories with a completed collection.
    Repos,
    /// Serve the metrics API and dashboard.
    Serve,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // Initialize tracing (logging)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collabflow=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}. Exiting.", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config: AppConfig) -> anyhow::Result<()> {
    // Collection is sequential; only the server needs worker threads.
    let runtime = match command {
        Command::Serve => tokio::runtime::Builder::new_multi_thread(),
        _ => tokio::runtime::Builder::new_current_thread(),
    }
    .enable_all()
    .build()
    .context("failed to start async runtime")?;

    runtime.block_on(async move {
        match command {
            Command::Collect { repo, num_prs } => collect(&config, &repo, num_prs).await,
            Command::Report { repo, metric } => report(&config, repo, metric).await,
            Command::Repos => list_repos(&config),
            Command::Serve => serve(config).await,
        }
    })
}

async fn collect(config: &AppConfig, repo: &RepoId, num_prs: Option<usize>) -> anyhow::Result<()> {
    if config.github_token.is_none() {
        tracing::warn!("GITHUB_TOKEN is not set; unauthenticated requests have a much lower rate limit");
    }

    let client = GitHubClient::new(config.api_config())?;
    let collector = Collector::new(
        client,
        DatasetStore::new(&config.data_dir),
        config.event_identity,
    );

    let summary = collector
        .collect(repo, num_prs.unwrap_or(config.default_pr_count))
        .await?;

    println!(
        "{}: {} new, {} updated, {} backfilled PRs; {} new events ({} PRs, {} events total)",
        repo,
        summary.new_prs,
        summary.updated_prs,
        summary.backfilled_prs,
        summary.events_appended,
        summary.total_prs,
        summary.total_events
    );
    Ok(())
}

async fn report(config: &AppConfig, repo: RepoId, metric: Option<String>) -> anyhow::Result<()> {
    let querier = MetricsQuerier::new(config);
    let json = match metric {
        Some(name) => serde_json::to_string_pretty(&querier.get_metric(repo, &name).await?)?,
        None => serde_json::to_string_pretty(&*querier.get(repo).await?)?,
    };
    println!("{json}");
    Ok(())
}

fn list_repos(config: &AppConfig) -> anyhow::Result<()> {
    let store = DatasetStore::new(&config.data_dir);
    for repo in store.list_repositories()? {
        println!("{repo}");
    }
    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(AppState::new(config));
    let app = create_app(state);

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind TCP listener on {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
