//! EntityMention: a provisional reference to an entity inside a statement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::EntityType;

/// A mention awaiting resolution. Once a resolution is recorded for its id
/// the mention is done; later deliveries return the recorded entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    /// Deterministic over `(statement_id, ordinal)`.
    pub id: Uuid,
    pub statement_id: Uuid,
    pub name: String,
    pub entity_type: EntityType,
    /// Whether this mention is the statement's subject.
    pub is_subject: bool,
    pub created_at: DateTime<Utc>,
}

impl EntityMention {
    pub fn new(
        statement_id: Uuid,
        ordinal: usize,
        name: impl Into<String>,
        entity_type: EntityType,
        is_subject: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v5(&statement_id, format!("mention:{ordinal}").as_bytes()),
            statement_id,
            name: name.into(),
            entity_type,
            is_subject,
            created_at: Utc::now(),
        }
    }
}
