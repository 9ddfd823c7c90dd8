//! Chunk: a contiguous, positioned span of one document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A bounded text span of a source document. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic over `(document_id, position)`.
    pub id: Uuid,
    pub document_id: Uuid,
    /// Zero-based order within the document.
    pub position: usize,
    /// Byte offset of the first byte in the document text.
    pub start: usize,
    /// Byte offset one past the last byte.
    pub end: usize,
    pub text: String,
    /// Timestamp of the owning document, used when a statement has no date.
    pub reference_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Stable chunk id, so that re-chunking a redelivered document yields
    /// the same records.
    pub fn id_for(document_id: Uuid, position: usize) -> Uuid {
        Uuid::new_v5(&document_id, format!("chunk:{position}").as_bytes())
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_deterministic() {
        let doc = Uuid::new_v4();
        assert_eq!(Chunk::id_for(doc, 3), Chunk::id_for(doc, 3));
        assert_ne!(Chunk::id_for(doc, 3), Chunk::id_for(doc, 4));
        assert_ne!(Chunk::id_for(doc, 0), Chunk::id_for(Uuid::new_v4(), 0));
    }

    #[test]
    fn test_chunk_len() {
        let doc = Uuid::new_v4();
        let chunk = Chunk {
            id: Chunk::id_for(doc, 0),
            document_id: doc,
            position: 0,
            start: 10,
            end: 25,
            text: "x".repeat(15),
            reference_time: Utc::now(),
            created_at: Utc::now(),
        };
        assert_eq!(chunk.len(), 15);
        assert!(!chunk.is_empty());
    }
}
