//! In-memory storage backend built on sharded concurrent maps.
//!
//! Every statement transition happens while holding that statement's map
//! entry, which makes activation and closing compare-and-set operations.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{PipelineError, Result};
use crate::model::{
    Chunk, Document, Entity, EntityMention, EntityType, Statement, StatementEvent,
    StatementEventKind, StatementStatus,
};
use crate::utils::text::normalize_key;

use super::{ChunkStore, Driver, EntityRegistry, StatementStore};

#[derive(Default)]
pub struct MemoryDriver {
    documents: DashMap<Uuid, Document>,
    chunks: DashMap<Uuid, Chunk>,
    document_chunks: DashMap<Uuid, Vec<Uuid>>,

    statements: DashMap<Uuid, Statement>,
    entity_statements: DashMap<Uuid, Vec<Uuid>>,
    events: DashMap<Uuid, Vec<StatementEvent>>,
    next_seq: AtomicU64,
    evaluated: DashSet<(Uuid, Uuid)>,

    entities: DashMap<Uuid, Entity>,
    alias_index: DashMap<(EntityType, String), Uuid>,
    mentions: DashMap<Uuid, EntityMention>,
    statement_mentions: DashMap<Uuid, Vec<Uuid>>,
    resolutions: DashMap<Uuid, Uuid>,

    unavailable: AtomicBool,
    injected_failures: AtomicUsize,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ping` fail, as an unreachable backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` bulk writes with a transient storage error.
    pub fn inject_transient_failures(&self, n: usize) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// All entities, for inspection.
    pub fn entities(&self) -> Vec<Entity> {
        self.entities.iter().map(|e| e.value().clone()).collect()
    }

    /// All statements, for inspection.
    pub fn statements(&self) -> Vec<Statement> {
        self.statements.iter().map(|s| s.value().clone()).collect()
    }

    fn check_write(&self) -> Result<()> {
        let took = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(PipelineError::storage_transient("injected write failure"));
        }
        Ok(())
    }

    fn record_event(&self, statement_id: Uuid, at: DateTime<Utc>, kind: StatementEventKind) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.events.entry(statement_id).or_default().push(StatementEvent {
            seq,
            statement_id,
            recorded_at: at,
            kind,
        });
    }

    fn entity_statements_where<F>(&self, entity_id: Uuid, keep: F) -> Vec<Statement>
    where
        F: Fn(&Statement) -> bool,
    {
        let ids = self
            .entity_statements
            .get(&entity_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut out: Vec<Statement> = ids
            .iter()
            .filter_map(|id| self.statements.get(id).map(|s| s.value().clone()))
            .filter(|s| keep(s))
            .collect();
        out.sort_by(|a, b| {
            a.valid_from
                .cmp(&b.valid_from)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        out
    }
}

impl Driver for MemoryDriver {
    async fn ping(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::storage("memory driver marked unavailable"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl ChunkStore for MemoryDriver {
    async fn insert_document(&self, document: &Document, chunks: &[Chunk]) -> Result<bool> {
        self.check_write()?;
        if chunks.iter().any(|c| c.document_id != document.id) {
            return Err(PipelineError::Validation(format!(
                "chunk batch for document {} contains foreign chunks",
                document.id
            )));
        }

        // The document entry guards the whole bulk write.
        match self.documents.entry(document.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let mut ids = Vec::with_capacity(chunks.len());
                for chunk in chunks {
                    ids.push(chunk.id);
                    self.chunks.insert(chunk.id, chunk.clone());
                }
                self.document_chunks.insert(document.id, ids);
                slot.insert(document.clone());
                debug!(document_id = %document.id, chunks = chunks.len(), "document stored");
                Ok(true)
            }
        }
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.documents.get(&id).map(|d| d.value().clone()))
    }

    async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let ids = self
            .document_chunks
            .get(&document_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut chunks: Vec<Chunk> = ids
            .iter()
            .filter_map(|id| self.chunks.get(id).map(|c| c.value().clone()))
            .collect();
        chunks.sort_by_key(|c| c.position);
        Ok(chunks)
    }

    async fn get_chunk(&self, id: Uuid) -> Result<Option<Chunk>> {
        Ok(self.chunks.get(&id).map(|c| c.value().clone()))
    }
}

impl StatementStore for MemoryDriver {
    async fn insert_statements(&self, statements: &[Statement]) -> Result<usize> {
        self.check_write()?;
        let mut inserted = 0;
        for statement in statements {
            if statement.status != StatementStatus::Proposed {
                return Err(PipelineError::Validation(format!(
                    "statement {} must be inserted as proposed",
                    statement.id
                )));
            }
            if let dashmap::mapref::entry::Entry::Vacant(slot) =
                self.statements.entry(statement.id)
            {
                let at = statement.created_at;
                slot.insert(statement.clone());
                self.record_event(
                    statement.id,
                    at,
                    StatementEventKind::Proposed(Box::new(statement.clone())),
                );
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_statement(&self, id: Uuid) -> Result<Option<Statement>> {
        Ok(self.statements.get(&id).map(|s| s.value().clone()))
    }

    async fn activate_statement(&self, id: Uuid, entity_id: Uuid) -> Result<bool> {
        let mut statement = self
            .statements
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("statement {id}")))?;
        let changed = statement.activate(entity_id)?;
        if changed {
            self.entity_statements.entry(entity_id).or_default().push(id);
            self.record_event(id, Utc::now(), StatementEventKind::Activated { entity_id });
        }
        Ok(changed)
    }

    async fn close_statement(
        &self,
        id: Uuid,
        valid_to: DateTime<Utc>,
        superseded_by: Option<Uuid>,
    ) -> Result<bool> {
        let mut statement = self
            .statements
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("statement {id}")))?;
        let at = Utc::now();
        let changed = statement.close(valid_to, superseded_by, at)?;
        if changed {
            // Record what was actually stored, which may be clamped.
            let stored_to = statement.valid_to.unwrap_or(valid_to);
            self.record_event(
                id,
                at,
                StatementEventKind::Closed {
                    valid_to: stored_to,
                    superseded_by,
                },
            );
        }
        Ok(changed)
    }

    async fn active_statements(&self, entity_id: Uuid) -> Result<Vec<Statement>> {
        Ok(self.entity_statements_where(entity_id, Statement::is_active))
    }

    async fn statements_valid_at(
        &self,
        entity_id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<Vec<Statement>> {
        Ok(self.entity_statements_where(entity_id, |s| s.is_valid_at(instant)))
    }

    async fn statements_overlapping(
        &self,
        entity_id: Uuid,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Statement>> {
        Ok(self.entity_statements_where(entity_id, |s| s.overlaps(from, to)))
    }

    async fn history(&self, entity_id: Uuid) -> Result<Vec<Statement>> {
        Ok(self.entity_statements_where(entity_id, |_| true))
    }

    async fn events(&self, statement_id: Uuid) -> Result<Vec<StatementEvent>> {
        Ok(self
            .events
            .get(&statement_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn clusters_with_min_active(&self, min_active: usize) -> Result<Vec<Uuid>> {
        let candidates: Vec<(Uuid, Vec<Uuid>)> = self
            .entity_statements
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|(_, ids)| {
                ids.iter()
                    .filter(|id| self.statements.get(id).is_some_and(|s| s.is_active()))
                    .count()
                    >= min_active
            })
            .map(|(entity_id, _)| entity_id)
            .collect())
    }

    async fn was_evaluated(&self, newer: Uuid, candidate: Uuid) -> Result<bool> {
        Ok(self.evaluated.contains(&(newer, candidate)))
    }

    async fn mark_evaluated(&self, newer: Uuid, candidates: &[Uuid]) -> Result<()> {
        for candidate in candidates {
            self.evaluated.insert((newer, *candidate));
        }
        Ok(())
    }
}

impl EntityRegistry for MemoryDriver {
    async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.entities.get(&id).map(|e| e.value().clone()))
    }

    async fn find_by_alias(&self, entity_type: EntityType, key: &str) -> Result<Option<Entity>> {
        let id = self
            .alias_index
            .get(&(entity_type, normalize_key(key)))
            .map(|id| *id.value());
        Ok(id.and_then(|id| self.entities.get(&id).map(|e| e.value().clone())))
    }

    async fn register_entity(&self, entity: &Entity) -> Result<()> {
        match self.entities.entry(entity.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(PipelineError::Validation(format!(
                    "entity {} already registered",
                    entity.id
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entity.clone());
            }
        }
        for alias in &entity.aliases {
            self.alias_index
                .entry((entity.entity_type, normalize_key(alias)))
                .or_insert(entity.id);
        }
        Ok(())
    }

    async fn add_alias(&self, entity_id: Uuid, alias: &str) -> Result<bool> {
        // Holding the entity entry serializes alias writes per entity.
        let mut entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or_else(|| PipelineError::NotFound(format!("entity {entity_id}")))?;
        let grew = entity.add_alias(alias);
        if grew {
            self.alias_index
                .entry((entity.entity_type, normalize_key(alias)))
                .or_insert(entity_id);
        }
        Ok(grew)
    }

    async fn record_mentions(&self, mentions: &[EntityMention]) -> Result<()> {
        for mention in mentions {
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.mentions.entry(mention.id) {
                slot.insert(mention.clone());
                self.statement_mentions
                    .entry(mention.statement_id)
                    .or_default()
                    .push(mention.id);
            }
        }
        Ok(())
    }

    async fn mentions_for_statement(&self, statement_id: Uuid) -> Result<Vec<EntityMention>> {
        let ids = self
            .statement_mentions
            .get(&statement_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.mentions.get(id).map(|m| m.value().clone()))
            .collect())
    }

    async fn record_resolution(&self, mention_id: Uuid, entity_id: Uuid) -> Result<Uuid> {
        Ok(*self.resolutions.entry(mention_id).or_insert(entity_id).value())
    }

    async fn resolution_of(&self, mention_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.resolutions.get(&mention_id).map(|r| *r.value()))
    }
}
