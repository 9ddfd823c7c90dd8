//! Exact brute-force index.

use std::collections::HashSet;
use std::sync::RwLock;

use uuid::Uuid;

use crate::errors::{PipelineError, Result};
use crate::utils::similarity::top_k_cosine;

use super::{Neighbor, SimilarityIndex};

#[derive(Default)]
struct Entries {
    owners: Vec<Uuid>,
    vectors: Vec<Vec<f32>>,
}

/// Scans every stored vector on each search.
#[derive(Default)]
pub struct FlatIndex {
    dim: Option<usize>,
    entries: RwLock<Entries>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject vectors whose length differs from `dim`.
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim: Some(dim),
            entries: RwLock::default(),
        }
    }

    fn poisoned() -> PipelineError {
        PipelineError::storage("similarity index lock poisoned")
    }
}

impl SimilarityIndex for FlatIndex {
    fn add(&self, owner: Uuid, vector: Vec<f32>) -> Result<()> {
        if let Some(dim) = self.dim {
            if vector.len() != dim {
                return Err(PipelineError::Validation(format!(
                    "vector has {} dims, index expects {dim}",
                    vector.len()
                )));
            }
        }
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.owners.push(owner);
        entries.vectors.push(vector);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let views: Vec<&[f32]> = entries.vectors.iter().map(Vec::as_slice).collect();

        // Rank all vectors, then keep the first (best) hit per owner.
        let mut seen = HashSet::new();
        let mut neighbors = Vec::with_capacity(k);
        for (pos, score) in top_k_cosine(query, &views, views.len()) {
            let owner = entries.owners[pos];
            if !seen.insert(owner) {
                continue;
            }
            neighbors.push(Neighbor { id: owner, score });
            if neighbors.len() == k {
                break;
            }
        }
        Ok(neighbors)
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.vectors.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_orders_by_score() {
        let index = FlatIndex::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.add(a, vec![1.0, 0.0]).unwrap();
        index.add(b, vec![0.6, 0.8]).unwrap();

        let hits = index.search(&[1.0, 0.1], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, a);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn owner_reported_once_with_best_alias() {
        let index = FlatIndex::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        index.add(owner, vec![0.0, 1.0]).unwrap();
        index.add(owner, vec![1.0, 0.0]).unwrap();
        index.add(other, vec![0.7, 0.7]).unwrap();

        let hits = index.search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, owner);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn empty_index_and_zero_k() {
        let index = FlatIndex::new();
        assert!(index.is_empty());
        assert!(index.search(&[1.0], 3).unwrap().is_empty());
        index.add(Uuid::new_v4(), vec![1.0]).unwrap();
        assert!(index.search(&[1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn dimension_is_enforced() {
        let index = FlatIndex::with_dim(3);
        assert!(index.add(Uuid::new_v4(), vec![1.0, 2.0]).is_err());
        assert!(index.add(Uuid::new_v4(), vec![1.0, 2.0, 3.0]).is_ok());
    }
}
