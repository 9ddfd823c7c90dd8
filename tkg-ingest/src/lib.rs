//! # tkg-ingest
//!
//! Staged ingestion of unstructured documents into a temporal knowledge graph.
//!
//! ## Architecture
//!
//! - **Staged pipeline**: chunking, statement extraction, entity extraction,
//!   entity resolution and temporal invalidation, each with its own worker
//!   pool, joined by bounded queues with depth-based admission control
//! - **Temporal model**: statements carry a validity interval; superseded
//!   statements are closed, never deleted
//! - **Pluggable capabilities**: text generation, embeddings and storage sit
//!   behind traits, with OpenAI-backed and in-memory implementations
//! - **At-least-once delivery**: deterministic ids and compare-and-set
//!   transitions make redelivered work harmless

pub mod errors;
pub mod model;
pub mod types;

pub mod driver;
pub mod embedder;
pub mod llm_client;
pub mod queue;

pub mod prompts;
pub mod search;

pub mod pipeline;
pub mod utils;

pub use errors::{LlmError, PipelineError, Result};
pub use pipeline::{Pipeline, PipelineSnapshot};
pub use types::{NearThresholdPolicy, PipelineConfig};
