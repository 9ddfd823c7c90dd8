mod config;
mod source;

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tokio::{signal, sync::watch};
use tracing::{error, info, warn};

use tkg_ingest::driver::{Driver, MemoryDriver};
use tkg_ingest::embedder::openai::OpenAiEmbedder;
use tkg_ingest::llm_client::openai::OpenAiClient;
use tkg_ingest::{Pipeline, PipelineConfig};

use crate::{config::Config, source::DocumentSource};

type WorkerPipeline = Pipeline<OpenAiClient, OpenAiEmbedder, MemoryDriver>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tkg_worker=info".parse()?)
                .add_directive("tkg_ingest=info".parse()?),
        )
        .json()
        .init();

    info!("tkg-worker starting");

    // ── Config ────────────────────────────────────────────────────────────────
    let mut config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    config.validate_input().await.map_err(|e| {
        error!("Input validation failed: {}", e);
        e
    })?;
    let pipeline_config = PipelineConfig::from_env().map_err(|e| {
        error!("Pipeline configuration error: {}", e);
        e
    })?;

    info!(
        input = %config.input_path.display(),
        addr  = %config.bind_addr,
        model = %pipeline_config.model_name,
        embedding_model = %pipeline_config.embedding_model,
        "configuration loaded"
    );

    // ── Pipeline ──────────────────────────────────────────────────────────────
    let llm = Arc::new(OpenAiClient::from_config(&pipeline_config));
    let embedder = Arc::new(OpenAiEmbedder::from_config(&pipeline_config));
    let store = Arc::new(MemoryDriver::new());
    let pipeline = Arc::new(Pipeline::new(pipeline_config, llm, embedder, store)?);
    pipeline.start().await?;

    let source = DocumentSource::new(config.input_path.clone(), config.max_file_size);
    let (done_tx, done_rx) = watch::channel(false);
    let ingest = tokio::spawn(ingest(Arc::clone(&pipeline), source, done_tx));

    // ── Axum router ───────────────────────────────────────────────────────────
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/review", get(review_handler))
        .with_state(Arc::clone(&pipeline));

    // ── Listen ────────────────────────────────────────────────────────────────
    info!(addr = %config.bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(stop_when(config.exit_when_idle, done_rx))
        .await?;

    if !ingest.is_finished() {
        ingest.abort();
    }
    pipeline.shutdown().await?;
    let stats = pipeline.stats();
    info!(
        review_items = stats.review_items,
        failures = stats.failures,
        "worker stopped"
    );
    Ok(())
}

/// Submit every document under the input directory and wait for the
/// pipeline to drain.
async fn ingest(pipeline: Arc<WorkerPipeline>, source: DocumentSource, done: watch::Sender<bool>) {
    let documents = match source.load_all().await {
        Ok(documents) => documents,
        Err(e) => {
            error!(root = %source.root().display(), error = %e, "could not scan input directory");
            done.send_replace(true);
            return;
        }
    };
    info!(documents = documents.len(), "submitting documents");

    if let Err(e) = pipeline.submit_all(documents).await {
        error!(error = %e, "document submission stopped early");
    }
    pipeline.wait_idle().await;

    let stats = pipeline.stats();
    for stage in &stats.stages {
        info!(
            stage = stage.stage,
            done = stage.outcomes.done,
            retried = stage.outcomes.retried,
            reviewed = stage.outcomes.reviewed,
            failed = stage.outcomes.failed,
            "stage summary"
        );
    }
    if stats.failures > 0 {
        warn!(failures = stats.failures, "some items failed, see /review");
    }
    info!("ingestion idle");
    done.send_replace(true);
}

/// Liveness probe: returns 200 as long as the process is running.
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe: returns 200 if storage answers.
async fn ready_handler(State(pipeline): State<Arc<WorkerPipeline>>) -> impl IntoResponse {
    match pipeline.store().ping().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn stats_handler(State(pipeline): State<Arc<WorkerPipeline>>) -> impl IntoResponse {
    Json(pipeline.stats())
}

async fn review_handler(State(pipeline): State<Arc<WorkerPipeline>>) -> impl IntoResponse {
    let review = pipeline.review_log();
    Json(serde_json::json!({
        "items": review.items(),
        "failures": review.failures(),
    }))
}

/// Resolves on a shutdown signal, or once ingestion is idle when
/// `exit_when_idle` is set.
async fn stop_when(exit_when_idle: bool, mut done: watch::Receiver<bool>) {
    let idle = async move {
        if exit_when_idle {
            if done.wait_for(|finished| *finished).await.is_ok() {
                info!("ingestion finished, shutting down");
                return;
            }
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = idle => {}
    }
}

/// Graceful shutdown on SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl-C, shutting down"); }
        _ = terminate => { info!("received SIGTERM, shutting down"); }
    }
}
