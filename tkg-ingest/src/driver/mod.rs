//! Storage driver abstraction.
//!
//! Storage is split by concern: [`ChunkStore`] for documents and chunks,
//! [`StatementStore`] for the append-only statement log, and
//! [`EntityRegistry`] for canonical entities, aliases, mentions and
//! resolutions. [`Storage`] bundles them for the pipeline.
//!
//! Every write is idempotent on ids so redelivered work never duplicates
//! records, and nothing is ever deleted.

pub mod memory;

pub use memory::MemoryDriver;

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{
    Chunk, Document, Entity, EntityMention, EntityType, Statement, StatementEvent,
};

/// Connection lifecycle of a storage backend.
pub trait Driver: Send + Sync {
    /// Health check; verify the backend is reachable.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    /// Release connections.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

pub trait ChunkStore: Send + Sync {
    /// Persist a document and all of its chunks in one bulk write.
    ///
    /// Returns `false` when the document was already stored; nothing is written then.
    fn insert_document(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> impl Future<Output = Result<bool>> + Send;

    fn get_document(&self, id: Uuid) -> impl Future<Output = Result<Option<Document>>> + Send;

    /// Chunks of a document in position order.
    fn chunks_for_document(
        &self,
        document_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Chunk>>> + Send;

    fn get_chunk(&self, id: Uuid) -> impl Future<Output = Result<Option<Chunk>>> + Send;
}

pub trait StatementStore: Send + Sync {
    /// Append new statements in `Proposed` state; ids already present are skipped.
    /// Returns how many were inserted.
    fn insert_statements(
        &self,
        statements: &[Statement],
    ) -> impl Future<Output = Result<usize>> + Send;

    fn get_statement(&self, id: Uuid) -> impl Future<Output = Result<Option<Statement>>> + Send;

    /// `Proposed → Active`, binding the statement to `entity_id`.
    /// `Ok(false)` if it was already active for that entity.
    fn activate_statement(
        &self,
        id: Uuid,
        entity_id: Uuid,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Compare-and-set `Active → Inactive`.
    ///
    /// `Ok(false)` when the statement was already inactive; the first close wins
    /// and later ones change nothing.
    fn close_statement(
        &self,
        id: Uuid,
        valid_to: DateTime<Utc>,
        superseded_by: Option<Uuid>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Active statements of an entity, ordered by `(valid_from, created_at)`.
    fn active_statements(
        &self,
        entity_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Statement>>> + Send;

    /// Statements of an entity whose validity interval contains `instant`,
    /// whatever their status.
    fn statements_valid_at(
        &self,
        entity_id: Uuid,
        instant: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Statement>>> + Send;

    /// Statements of an entity whose validity interval intersects `[from, to)`.
    fn statements_overlapping(
        &self,
        entity_id: Uuid,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<Statement>>> + Send;

    /// Every statement ever attached to an entity, ordered by `(valid_from, created_at)`.
    fn history(&self, entity_id: Uuid) -> impl Future<Output = Result<Vec<Statement>>> + Send;

    /// Recorded transitions of one statement, oldest first.
    fn events(
        &self,
        statement_id: Uuid,
    ) -> impl Future<Output = Result<Vec<StatementEvent>>> + Send;

    /// Entities with at least `min_active` active statements.
    fn clusters_with_min_active(
        &self,
        min_active: usize,
    ) -> impl Future<Output = Result<Vec<Uuid>>> + Send;

    /// Whether `candidate` was already judged against `newer`.
    fn was_evaluated(
        &self,
        newer: Uuid,
        candidate: Uuid,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn mark_evaluated(
        &self,
        newer: Uuid,
        candidates: &[Uuid],
    ) -> impl Future<Output = Result<()>> + Send;
}

pub trait EntityRegistry: Send + Sync {
    fn get_entity(&self, id: Uuid) -> impl Future<Output = Result<Option<Entity>>> + Send;

    /// Entity of `entity_type` with an alias whose normalized key equals `key`.
    fn find_by_alias(
        &self,
        entity_type: EntityType,
        key: &str,
    ) -> impl Future<Output = Result<Option<Entity>>> + Send;

    /// Store a new canonical entity and index its aliases.
    fn register_entity(&self, entity: &Entity) -> impl Future<Output = Result<()>> + Send;

    /// Append an alias. Writes to the same entity are serialized.
    /// Returns whether the alias set grew.
    fn add_alias(&self, entity_id: Uuid, alias: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Store mentions; ids already present are skipped.
    fn record_mentions(
        &self,
        mentions: &[EntityMention],
    ) -> impl Future<Output = Result<()>> + Send;

    fn mentions_for_statement(
        &self,
        statement_id: Uuid,
    ) -> impl Future<Output = Result<Vec<EntityMention>>> + Send;

    /// Record `mention → entity`. The first resolution wins; the recorded
    /// entity id is returned either way.
    fn record_resolution(
        &self,
        mention_id: Uuid,
        entity_id: Uuid,
    ) -> impl Future<Output = Result<Uuid>> + Send;

    fn resolution_of(&self, mention_id: Uuid) -> impl Future<Output = Result<Option<Uuid>>> + Send;
}

/// Everything the pipeline needs from a backend.
pub trait Storage: Driver + ChunkStore + StatementStore + EntityRegistry {}

impl<T> Storage for T where T: Driver + ChunkStore + StatementStore + EntityRegistry {}
