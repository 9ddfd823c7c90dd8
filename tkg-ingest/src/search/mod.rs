//! Nearest-neighbour search over entity embeddings.
//!
//! The resolver keeps one index per entity type, so a search never returns
//! an entity of a different type.

pub mod flat;

pub use flat::FlatIndex;

use uuid::Uuid;

use crate::errors::Result;

/// One search hit: the owning entity and its best cosine score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: Uuid,
    pub score: f32,
}

/// Vector index keyed by owner id. An owner may hold several vectors (one per
/// alias); search reports each owner once with its best-scoring vector.
pub trait SimilarityIndex: Send + Sync {
    fn add(&self, owner: Uuid, vector: Vec<f32>) -> Result<()>;

    /// Up to `k` owners by descending cosine similarity to `query`.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// Number of stored vectors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
