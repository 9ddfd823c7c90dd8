//! [`EmbedderClient`] backed by the OpenAI embeddings endpoint.
//!
//! Batches are split to respect the per-request input limit. Connection
//! failures and timeouts are retried under a [`ClientBackoff`]; every other
//! API error is permanent.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{CreateEmbeddingRequest, CreateEmbeddingRequestArgs},
    Client,
};
use tracing::{debug, warn};

use crate::embedder::{EmbedderClient, Embedding};
use crate::errors::{PipelineError, Result};
use crate::types::PipelineConfig;
use crate::utils::retry::ClientBackoff;

pub const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// Inputs accepted by one embeddings request.
const MAX_INPUTS_PER_REQUEST: usize = 2048;

/// Output size of a model when no `dimensions` are requested.
fn native_dim(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

fn into_backoff(err: OpenAIError) -> backoff::Error<PipelineError> {
    let retryable = matches!(&err, OpenAIError::Reqwest(e) if e.is_timeout() || e.is_connect());
    let message = err.to_string();
    if retryable {
        warn!(error = %message, "embedding request failed, backing off");
        backoff::Error::transient(PipelineError::embedder_transient(message))
    } else {
        backoff::Error::permanent(PipelineError::embedder(message))
    }
}

pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dim: usize,
    /// Sent as `dimensions` when set; the model truncates its output to it.
    dimensions: Option<u32>,
    backoff: ClientBackoff,
}

impl OpenAiEmbedder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_openai_config(OpenAIConfig::new().with_api_key(api_key.into()), model)
    }

    /// Embedder for `TKG_EMBEDDING_MODEL`, producing `TKG_EMBEDDING_DIM`-sized
    /// vectors.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let embedder = Self::new(config.openai_api_key.clone(), config.embedding_model.clone())
            .with_backoff(config.client_backoff());
        if embedder.dim == config.embedding_dim {
            embedder
        } else {
            embedder.with_dimensions(config.embedding_dim)
        }
    }

    fn with_openai_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            client: Client::with_config(config),
            dim: native_dim(&model),
            model,
            dimensions: None,
            backoff: ClientBackoff::default(),
        }
    }

    /// Request `dim`-sized vectors (`text-embedding-3-*` only).
    pub fn with_dimensions(mut self, dim: usize) -> Self {
        self.dim = dim;
        self.dimensions = u32::try_from(dim).ok();
        self
    }

    pub fn with_backoff(mut self, backoff: ClientBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn request(&self, texts: &[&str]) -> Result<CreateEmbeddingRequest> {
        // The endpoint rejects empty strings.
        let input: Vec<String> = texts
            .iter()
            .map(|t| if t.trim().is_empty() { " ".to_string() } else { (*t).to_string() })
            .collect();
        let mut args = CreateEmbeddingRequestArgs::default();
        args.model(self.model.as_str()).input(input);
        if let Some(dimensions) = self.dimensions {
            args.dimensions(dimensions);
        }
        args.build()
            .map_err(|e| PipelineError::embedder(format!("invalid embedding request: {e}")))
    }

    /// One request for at most [`MAX_INPUTS_PER_REQUEST`] texts.
    async fn embed_request(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let request = self.request(texts)?;
        let response = backoff::future::retry(self.backoff.schedule(), || async {
            self.client
                .embeddings()
                .create(request.clone())
                .await
                .map_err(into_backoff)
        })
        .await?;

        let mut data = response.data;
        if data.len() != texts.len() {
            return Err(PipelineError::embedder(format!(
                "embedding API returned {} vectors for {} inputs",
                data.len(),
                texts.len()
            )));
        }
        data.sort_by_key(|item| item.index);
        debug!(model = %self.model, inputs = texts.len(), "embedded batch");
        Ok(data
            .into_iter()
            .map(|item| item.embedding.into_iter().map(|x| x as f32).collect())
            .collect())
    }
}

impl EmbedderClient for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_request(&[text])
            .await?
            .pop()
            .ok_or_else(|| PipelineError::embedder("embedding API returned no vector"))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for group in texts.chunks(MAX_INPUTS_PER_REQUEST) {
            vectors.extend(self.embed_request(group).await?);
        }
        Ok(vectors)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// `count` vectors of `dim` components; vector `i` is filled with `i + 1`.
    /// Listed in reverse index order to exercise the sort.
    fn vectors(count: usize, dim: usize) -> Value {
        let data: Vec<Value> = (0..count)
            .rev()
            .map(|i| json!({ "object": "embedding", "index": i, "embedding": vec![(i + 1) as f32; dim] }))
            .collect();
        json!({
            "object": "list",
            "data": data,
            "model": DEFAULT_MODEL,
            "usage": { "prompt_tokens": 4, "total_tokens": 4 },
        })
    }

    fn embedder(server: &MockServer) -> OpenAiEmbedder {
        let config = OpenAIConfig::new()
            .with_api_key("sk-test")
            .with_api_base(server.uri());
        OpenAiEmbedder::with_openai_config(config, DEFAULT_MODEL).with_backoff(ClientBackoff {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            max_elapsed: Duration::from_secs(2),
        })
    }

    #[test]
    fn dimension_defaults_per_model() {
        assert_eq!(OpenAiEmbedder::new("k", DEFAULT_MODEL).dim(), 1536);
        assert_eq!(OpenAiEmbedder::new("k", "text-embedding-3-large").dim(), 3072);
        assert_eq!(OpenAiEmbedder::new("k", DEFAULT_MODEL).with_dimensions(64).dim(), 64);
    }

    #[test]
    fn config_dimension_is_requested_when_it_differs() {
        let config = PipelineConfig {
            embedding_dim: 256,
            ..PipelineConfig::default()
        };
        let embedder = OpenAiEmbedder::from_config(&config);
        assert_eq!(embedder.dim(), 256);
        assert_eq!(embedder.dimensions, Some(256));

        let native = OpenAiEmbedder::from_config(&PipelineConfig::default());
        assert_eq!(native.dimensions, None);
    }

    #[tokio::test]
    async fn batch_results_follow_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vectors(3, 2)))
            .mount(&server)
            .await;

        let out = embedder(&server)
            .embed_batch(&["Acme", "Beta", "Gamma"])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]]);
    }

    #[tokio::test]
    async fn requested_dimensions_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({ "dimensions": 2 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(vectors(1, 2)))
            .expect(1)
            .mount(&server)
            .await;

        let v = embedder(&server).with_dimensions(2).embed("Acme").await.unwrap();
        assert_eq!(v.len(), 2);
    }

    #[tokio::test]
    async fn vector_count_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vectors(1, 2)))
            .mount(&server)
            .await;

        let err = embedder(&server).embed_batch(&["a", "b"]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Embedder { transient: false, .. }));
    }

    #[tokio::test]
    async fn empty_batch_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        assert!(embedder(&server).embed_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_key_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {
                    "message": "Incorrect API key provided.",
                    "type": "invalid_request_error",
                    "param": null,
                    "code": "invalid_api_key",
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = embedder(&server).embed("Acme").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
