//! Embedding capability.
//!
//! # Implementations
//! - [`openai::OpenAiEmbedder`]: OpenAI embeddings API via `async-openai`.
//! - [`hashing::HashingEmbedder`]: deterministic character-trigram hashing.

pub mod hashing;
pub mod openai;

use std::future::Future;

use crate::errors::Result;

pub type Embedding = Vec<f32>;

/// Text to vector. Entity names and statement texts go through the same client,
/// so every stored vector shares one dimension.
pub trait EmbedderClient: Send + Sync {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Embedding>> + Send;

    /// One vector per input, in input order.
    fn embed_batch(&self, texts: &[&str]) -> impl Future<Output = Result<Vec<Embedding>>> + Send;

    /// Length of every vector this client returns.
    fn dim(&self) -> usize;
}
