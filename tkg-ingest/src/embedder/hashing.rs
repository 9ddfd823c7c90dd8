//! Deterministic embedder based on character-trigram feature hashing.
//!
//! Similar surface forms land close together, which is enough to drive
//! entity resolution without a network call. Exact vectors can be pinned per
//! text to script a precise similarity.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::errors::{PipelineError, Result};
use crate::utils::similarity::normalize_l2;
use crate::utils::text::normalize_key;

use super::{Embedding, EmbedderClient};

pub const DEFAULT_DIM: usize = 256;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
    overrides: HashMap<String, Embedding>,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIM)
    }
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            overrides: HashMap::new(),
        }
    }

    /// Return `vector` (L2-normalized) whenever `text` is embedded.
    /// Matching uses the normalized key, so case and trailing punctuation don't matter.
    pub fn with_vector(mut self, text: &str, vector: Embedding) -> Self {
        self.overrides.insert(normalize_key(text), normalize_l2(&vector));
        self
    }

    fn vectorize(&self, text: &str) -> Result<Embedding> {
        let key = normalize_key(text);
        if let Some(v) = self.overrides.get(&key) {
            if v.len() != self.dim {
                return Err(PipelineError::embedder(format!(
                    "pinned vector for '{key}' has {} dims, expected {}",
                    v.len(),
                    self.dim
                )));
            }
            return Ok(v.clone());
        }

        let mut v = vec![0.0_f32; self.dim];
        let padded: Vec<char> = format!("  {key} ").chars().collect();
        for gram in padded.windows(3) {
            let mut h = DefaultHasher::new();
            gram.hash(&mut h);
            let bucket = (h.finish() % self.dim as u64) as usize;
            v[bucket] += 1.0;
        }
        Ok(normalize_l2(&v))
    }
}

impl EmbedderClient for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.vectorize(text)
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.vectorize(t)).collect()
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
