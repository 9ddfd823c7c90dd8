//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tkg_ingest::driver::MemoryDriver;
use tkg_ingest::embedder::hashing::HashingEmbedder;
use tkg_ingest::llm_client::mock::ScriptedLlmClient;
use tkg_ingest::model::{Document, SourceMetadata, TrustLevel};
use tkg_ingest::{Pipeline, PipelineConfig};

pub type TestPipeline = Pipeline<ScriptedLlmClient, HashingEmbedder, MemoryDriver>;

pub fn year(y: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).unwrap()
}

pub fn document(text: &str) -> Document {
    Document::new(
        text,
        SourceMetadata {
            origin: "test".to_string(),
            timestamp: year(2024),
            trust: TrustLevel::Standard,
        },
    )
}

/// Fast, small settings for in-process runs.
pub fn config(embedding_dim: usize) -> PipelineConfig {
    PipelineConfig {
        embedding_dim,
        workers_per_stage: 2,
        document_batch_size: 4,
        chunk_batch_size: 4,
        statement_batch_size: 4,
        mention_batch_size: 8,
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        call_timeout_secs: 5,
        queue_depth_limit: 64,
        partitions: 4,
        sweep_interval_secs: 3_600,
        ..PipelineConfig::default()
    }
}

pub fn statements_json(subject: &str, text: &str, valid_from: &str) -> String {
    serde_json::json!({
        "statements": [{ "subject": subject, "text": text, "valid_from": valid_from, "valid_to": null }]
    })
    .to_string()
}

pub fn subject_only(name: &str) -> String {
    serde_json::json!({
        "entities": [{ "name": name, "entity_type": "Organization", "is_subject": true }]
    })
    .to_string()
}

pub async fn start(
    config: PipelineConfig,
    llm: ScriptedLlmClient,
    embedder: HashingEmbedder,
) -> (TestPipeline, Arc<MemoryDriver>, Arc<ScriptedLlmClient>) {
    let store = Arc::new(MemoryDriver::new());
    let llm = Arc::new(llm);
    let pipeline = Pipeline::new(config, Arc::clone(&llm), Arc::new(embedder), Arc::clone(&store))
        .expect("valid config");
    pipeline.start().await.expect("pipeline starts");
    (pipeline, store, llm)
}

pub async fn settle(pipeline: &TestPipeline) {
    tokio::time::timeout(Duration::from_secs(10), pipeline.wait_idle())
        .await
        .expect("pipeline goes idle");
}
