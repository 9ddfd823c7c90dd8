//! Pipeline configuration.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{PipelineError, Result};
use crate::utils::retry::{ClientBackoff, RetryPolicy};

/// What the resolver does with a mention whose best match lands just below
/// the merge threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NearThresholdPolicy {
    /// Flag the mention for manual review and leave it unresolved.
    Review,
    /// Treat it as a match.
    Merge,
    /// Register a new canonical entity.
    Register,
}

impl FromStr for NearThresholdPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "review" => Ok(Self::Review),
            "merge" => Ok(Self::Merge),
            "register" => Ok(Self::Register),
            other => Err(PipelineError::Validation(format!(
                "unknown near-threshold policy '{other}'"
            ))),
        }
    }
}

/// Central configuration, loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    /// OpenAI API key. Only required by the OpenAI-backed capabilities.
    #[serde(skip_serializing, default)]
    pub openai_api_key: String,

    /// Chat model used for extraction and invalidation.
    pub model_name: String,

    /// Embedding model used by the resolver.
    pub embedding_model: String,

    /// Embedding vector dimension (must be > 0).
    #[validate(range(min = 1))]
    pub embedding_dim: usize,

    /// Upper bound on chunk length, in bytes.
    #[validate(range(min = 16))]
    pub chunk_max_chars: usize,

    #[validate(range(min = 1))]
    pub document_batch_size: usize,

    #[validate(range(min = 1))]
    pub chunk_batch_size: usize,

    #[validate(range(min = 1))]
    pub statement_batch_size: usize,

    #[validate(range(min = 1))]
    pub mention_batch_size: usize,

    /// Worker tasks spawned per stage.
    #[validate(range(min = 1))]
    pub workers_per_stage: usize,

    /// In-flight text-generation calls allowed per stage.
    #[validate(range(min = 1))]
    pub llm_concurrency: usize,

    /// In-flight embedding calls allowed per stage.
    #[validate(range(min = 1))]
    pub embed_concurrency: usize,

    /// Attempts per capability call before the item is requeued.
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Per-call timeout for capability calls.
    #[validate(range(min = 1))]
    pub call_timeout_secs: u64,

    /// Deliveries of one queue item before it is reported as failed.
    #[validate(range(min = 1))]
    pub max_redeliveries: u32,

    /// Queue depth at which upstream admission pauses.
    #[validate(range(min = 1))]
    pub queue_depth_limit: usize,

    /// Partition count for resolver and invalidator batches.
    #[validate(range(min = 1))]
    pub partitions: usize,

    /// Cosine similarity at or above which a mention merges into an entity.
    #[validate(range(min = 0.0, max = 1.0))]
    pub merge_threshold: f32,

    /// Width of the band below `merge_threshold` handled by `near_threshold_policy`.
    #[validate(range(min = 0.0, max = 1.0))]
    pub review_margin: f32,

    pub near_threshold_policy: NearThresholdPolicy,

    /// Supersede verdicts below this confidence go to review instead.
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_supersede_confidence: f32,

    /// Period of the invalidation sweep.
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,

    /// Embed statement text during extraction.
    pub embed_statements: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            model_name: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dim: 1536,
            chunk_max_chars: 1_000,
            document_batch_size: 200,
            chunk_batch_size: 64,
            statement_batch_size: 64,
            mention_batch_size: 128,
            workers_per_stage: 2,
            llm_concurrency: 8,
            embed_concurrency: 4,
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            call_timeout_secs: 60,
            max_redeliveries: 3,
            queue_depth_limit: 1_000,
            partitions: 8,
            merge_threshold: 0.85,
            review_margin: 0.05,
            near_threshold_policy: NearThresholdPolicy::Review,
            min_supersede_confidence: 0.5,
            sweep_interval_secs: 300,
            embed_statements: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` first (non-fatal if `.env` is absent).
    /// `OPENAI_API_KEY` is required; every other variable falls back to
    /// [`PipelineConfig::default`].
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|name| std::env::var(name).ok())?;
        if config.openai_api_key.is_empty() {
            return Err(PipelineError::Validation(
                "OPENAI_API_KEY is required".to_string(),
            ));
        }
        Ok(config)
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let config = Self {
            openai_api_key: lookup("OPENAI_API_KEY").unwrap_or_default(),
            model_name: lookup("TKG_MODEL_NAME").unwrap_or(d.model_name),
            embedding_model: lookup("TKG_EMBEDDING_MODEL").unwrap_or(d.embedding_model),
            embedding_dim: parse_var(&lookup, "TKG_EMBEDDING_DIM", d.embedding_dim)?,
            chunk_max_chars: parse_var(&lookup, "TKG_CHUNK_MAX_CHARS", d.chunk_max_chars)?,
            document_batch_size: parse_var(
                &lookup,
                "TKG_DOCUMENT_BATCH_SIZE",
                d.document_batch_size,
            )?,
            chunk_batch_size: parse_var(&lookup, "TKG_CHUNK_BATCH_SIZE", d.chunk_batch_size)?,
            statement_batch_size: parse_var(
                &lookup,
                "TKG_STATEMENT_BATCH_SIZE",
                d.statement_batch_size,
            )?,
            mention_batch_size: parse_var(
                &lookup,
                "TKG_MENTION_BATCH_SIZE",
                d.mention_batch_size,
            )?,
            workers_per_stage: parse_var(&lookup, "TKG_WORKERS_PER_STAGE", d.workers_per_stage)?,
            llm_concurrency: parse_var(&lookup, "TKG_LLM_CONCURRENCY", d.llm_concurrency)?,
            embed_concurrency: parse_var(&lookup, "TKG_EMBED_CONCURRENCY", d.embed_concurrency)?,
            max_attempts: parse_var(&lookup, "TKG_MAX_ATTEMPTS", d.max_attempts)?,
            initial_backoff_ms: parse_var(
                &lookup,
                "TKG_INITIAL_BACKOFF_MS",
                d.initial_backoff_ms,
            )?,
            max_backoff_ms: parse_var(&lookup, "TKG_MAX_BACKOFF_MS", d.max_backoff_ms)?,
            call_timeout_secs: parse_var(&lookup, "TKG_CALL_TIMEOUT_SECS", d.call_timeout_secs)?,
            max_redeliveries: parse_var(&lookup, "TKG_MAX_REDELIVERIES", d.max_redeliveries)?,
            queue_depth_limit: parse_var(&lookup, "TKG_QUEUE_DEPTH_LIMIT", d.queue_depth_limit)?,
            partitions: parse_var(&lookup, "TKG_PARTITIONS", d.partitions)?,
            merge_threshold: parse_var(&lookup, "TKG_MERGE_THRESHOLD", d.merge_threshold)?,
            review_margin: parse_var(&lookup, "TKG_REVIEW_MARGIN", d.review_margin)?,
            near_threshold_policy: parse_var(
                &lookup,
                "TKG_NEAR_THRESHOLD_POLICY",
                d.near_threshold_policy,
            )?,
            min_supersede_confidence: parse_var(
                &lookup,
                "TKG_MIN_SUPERSEDE_CONFIDENCE",
                d.min_supersede_confidence,
            )?,
            sweep_interval_secs: parse_var(
                &lookup,
                "TKG_SWEEP_INTERVAL_SECS",
                d.sweep_interval_secs,
            )?,
            embed_statements: parse_var(&lookup, "TKG_EMBED_STATEMENTS", d.embed_statements)?,
        };

        config.check()?;
        Ok(config)
    }

    /// Run field validation plus the cross-field rules.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| PipelineError::Validation(e.to_string()))?;

        if self.review_margin > self.merge_threshold {
            return Err(PipelineError::Validation(
                "TKG_REVIEW_MARGIN must not exceed TKG_MERGE_THRESHOLD".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(PipelineError::Validation(
                "TKG_INITIAL_BACKOFF_MS must not exceed TKG_MAX_BACKOFF_MS".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry discipline shared by every capability call.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_millis(self.max_backoff_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    /// Backoff for the OpenAI adapters, bounded by the per-call timeout.
    pub fn client_backoff(&self) -> ClientBackoff {
        ClientBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_millis(self.max_backoff_ms),
            max_elapsed: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            PipelineError::Validation(format!("{name} has an invalid value '{raw}'"))
        }),
        None => Ok(default),
    }
}

/// Convenience for tests and tools that hold variables in a map.
pub fn lookup_from_map(vars: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |name| vars.get(name).cloned()
}
