mod cache;
mod config;
mod metrics;
mod runs;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use extract::{CompletionBackend, OllamaClient, RetryPolicy};
use graph::Neo4jImporter;

use crate::cache::{CacheStats, CachingBackend, ResponseCache};
use crate::config::AppConfig;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::runs::{RunRequest, RunService, RunView};

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    runs: Arc<RunService>,
    cache: Option<Arc<ResponseCache>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    ollama: String,
    neo4j: String,
}

#[derive(Serialize)]
struct RunStarted {
    run_id: Uuid,
}

#[derive(Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CacheStats>,
}

/// `api [--config <path>] [--run <transcripts>]`
struct CliArgs {
    config: Option<PathBuf>,
    run: Option<String>,
}

fn parse_args() -> Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut cli = CliArgs {
        config: None,
        run: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                cli.config = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            "--run" => cli.run = Some(args.next().context("--run needs a path")?),
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }
    Ok(cli)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args()?;
    let config = Arc::new(AppConfig::load(cli.config.as_deref())?);
    init_tracing(config.server.json_logs);

    let ollama: Arc<dyn CompletionBackend> = Arc::new(OllamaClient::new(
        config.ollama.base_url.clone(),
        Duration::from_secs(config.ollama.request_timeout_secs),
    ));
    let cache = config
        .cache
        .enabled
        .then(|| Arc::new(ResponseCache::new(config.cache.max_entries)));
    let backend: Arc<dyn CompletionBackend> = match &cache {
        Some(cache) => Arc::new(CachingBackend::new(ollama, cache.clone())),
        None => ollama,
    };

    let importer = match &config.neo4j {
        Some(neo4j) => {
            let retry = RetryPolicy::from_config(&config.pipeline.retry);
            match Neo4jImporter::connect(&neo4j.uri, &neo4j.user, &neo4j.password, retry).await {
                Ok(importer) => {
                    importer.init_schema().await?;
                    Some(Arc::new(importer))
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Neo4j unavailable, runs will not be imported");
                    None
                }
            }
        }
        None => None,
    };

    let runs = Arc::new(RunService::new(config.clone(), backend, importer, Metrics::new()));

    // One-shot mode: code the transcripts, print the run, exit
    if let Some(path) = cli.run {
        let view = runs
            .run_to_completion(RunRequest {
                path,
                discovery_mode: None,
                existing: Default::default(),
            })
            .await?;
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let state = AppState {
        config: config.clone(),
        runs,
        cache,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/runs", post(start_run))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/stop", post(stop_run))
        .route("/metrics", get(get_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .context(format!("Failed to bind {}", config.server.bind_address))?;

    info!("Server listening on http://{}", config.server.bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let tags_url = format!("{}/api/tags", state.config.ollama.base_url.trim_end_matches('/'));
    let ollama = match reqwest::get(&tags_url).await {
        Ok(resp) if resp.status().is_success() => "ok".to_string(),
        Ok(resp) => format!("error: status {}", resp.status()),
        Err(e) => format!("error: {}", e),
    };

    let neo4j = if state.runs.has_importer() {
        "connected".to_string()
    } else {
        "disabled".to_string()
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        ollama,
        neo4j,
    })
}

async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunStarted>), StatusCode> {
    if !PathBuf::from(&req.path).exists() {
        return Err(StatusCode::NOT_FOUND);
    }
    let run_id = state.runs.start(req);
    Ok((StatusCode::ACCEPTED, Json(RunStarted { run_id })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunView>, StatusCode> {
    state.runs.get(run_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn stop_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> StatusCode {
    if state.runs.stop(run_id) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        metrics: state.runs.metrics().snapshot(),
        cache: state.cache.as_ref().map(|c| c.stats()),
    })
}
