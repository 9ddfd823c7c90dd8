//! Statement: an atomic, time-bounded factual claim tied to one entity.
//!
//! Statements are append-only. Their lifecycle is
//! `Proposed → Active → Inactive`, and every transition is recorded as a
//! [`StatementEvent`]; the current [`Statement`] value is the fold of its
//! events. An inactive statement is terminal: a correction is a new statement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{PipelineError, Result};

/// Lifecycle state of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementStatus {
    /// Extracted, subject entity not yet resolved.
    Proposed,
    Active,
    /// Superseded; validity window closed. Terminal.
    Inactive,
}

/// A factual claim with a real-world validity interval.
///
/// - **Valid time** (`valid_from` / `valid_to`): when the claim held in the world.
/// - **Record time** (`created_at` / `invalidated_at`): when the pipeline learned
///   and retired it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: Uuid,
    /// Chunks the claim was extracted from.
    pub chunk_ids: Vec<Uuid>,
    /// Subject as written in the source, before resolution.
    pub subject: String,
    /// Canonical entity owning the claim; set on activation.
    pub entity_id: Option<Uuid>,
    pub text: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub status: StatementStatus,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<Uuid>,
}

impl Statement {
    /// A freshly extracted statement.
    ///
    /// The id is derived from the chunk, the statement's ordinal within the
    /// extraction and its text, so redelivering a chunk is idempotent.
    pub fn proposed(
        chunk_id: Uuid,
        ordinal: usize,
        subject: impl Into<String>,
        text: impl Into<String>,
        valid_from: DateTime<Utc>,
        valid_to: Option<DateTime<Utc>>,
    ) -> Self {
        let text = text.into();
        let id = Uuid::new_v5(&chunk_id, format!("statement:{ordinal}:{text}").as_bytes());
        Self {
            id,
            chunk_ids: vec![chunk_id],
            subject: subject.into(),
            entity_id: None,
            text,
            valid_from,
            valid_to,
            status: StatementStatus::Proposed,
            embedding: None,
            created_at: Utc::now(),
            invalidated_at: None,
            superseded_by: None,
        }
    }

    /// Bind the statement to its canonical entity.
    ///
    /// Returns `Ok(false)` when already active for the same entity.
    pub fn activate(&mut self, entity_id: Uuid) -> Result<bool> {
        match self.status {
            StatementStatus::Proposed => {
                self.entity_id = Some(entity_id);
                self.status = StatementStatus::Active;
                Ok(true)
            }
            StatementStatus::Active if self.entity_id == Some(entity_id) => Ok(false),
            from => Err(PipelineError::InvalidTransition {
                id: self.id,
                from,
                to: StatementStatus::Active,
            }),
        }
    }

    /// Close the validity window and retire the statement.
    ///
    /// Returns `Ok(false)` without touching anything when the statement is
    /// already inactive, so the first close always wins.
    pub fn close(
        &mut self,
        valid_to: DateTime<Utc>,
        superseded_by: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        match self.status {
            StatementStatus::Active => {
                // a window never closes before it opens
                self.valid_to = Some(valid_to.max(self.valid_from));
                self.superseded_by = superseded_by;
                self.invalidated_at = Some(at);
                self.status = StatementStatus::Inactive;
                Ok(true)
            }
            StatementStatus::Inactive => Ok(false),
            from => Err(PipelineError::InvalidTransition {
                id: self.id,
                from,
                to: StatementStatus::Inactive,
            }),
        }
    }

    /// Apply a recorded event. Used when replaying a statement's history.
    pub fn apply(&mut self, event: &StatementEvent) -> Result<bool> {
        match &event.kind {
            StatementEventKind::Proposed(_) => Ok(false),
            StatementEventKind::Activated { entity_id } => self.activate(*entity_id),
            StatementEventKind::Closed {
                valid_to,
                superseded_by,
            } => self.close(*valid_to, *superseded_by, event.recorded_at),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == StatementStatus::Active
    }

    /// Whether the claim held at `instant` (half-open `[valid_from, valid_to)`).
    pub fn is_valid_at(&self, instant: DateTime<Utc>) -> bool {
        self.valid_from <= instant && self.valid_to.map_or(true, |end| instant < end)
    }

    /// Whether the validity interval intersects `[from, to)`; `to = None` is unbounded.
    pub fn overlaps(&self, from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> bool {
        let starts_before_end = to.map_or(true, |end| self.valid_from < end);
        let ends_after_start = self.valid_to.map_or(true, |end| from < end);
        starts_before_end && ends_after_start
    }
}

/// One entry of the append-only statement log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementEvent {
    /// Position in the global log.
    pub seq: u64,
    pub statement_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub kind: StatementEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatementEventKind {
    Proposed(Box<Statement>),
    Activated {
        entity_id: Uuid,
    },
    Closed {
        valid_to: DateTime<Utc>,
        superseded_by: Option<Uuid>,
    },
}
