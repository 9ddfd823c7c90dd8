//! Entity: the canonical referent that statements attach to.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::utils::text::normalize_key;

/// Controlled entity vocabulary. Resolution never merges across types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Event,
    Product,
    Concept,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Person,
        EntityType::Organization,
        EntityType::Location,
        EntityType::Event,
        EntityType::Product,
        EntityType::Concept,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "Person",
            EntityType::Organization => "Organization",
            EntityType::Location => "Location",
            EntityType::Event => "Event",
            EntityType::Product => "Product",
            EntityType::Concept => "Concept",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = PipelineError;

    /// Case-insensitive; anything outside the vocabulary is a validation error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PipelineError::Validation(format!("unknown entity type '{s}'")))
    }
}

/// A canonical entity. Aliases only ever grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    pub entity_type: EntityType,
    /// Surface forms merged into this entity, including `name`.
    pub aliases: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            aliases: vec![name.clone()],
            name,
            entity_type,
            created_at: Utc::now(),
        }
    }

    /// Append `alias` unless an equivalent form is already known.
    /// Returns whether the alias set grew.
    pub fn add_alias(&mut self, alias: &str) -> bool {
        let key = normalize_key(alias);
        if key.is_empty() || self.aliases.iter().any(|a| normalize_key(a) == key) {
            return false;
        }
        self.aliases.push(alias.trim().to_string());
        true
    }
}
