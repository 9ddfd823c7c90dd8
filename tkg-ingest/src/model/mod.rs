//! Data model for the ingestion pipeline.
//!
//! - [`Document`]: immutable raw input with source metadata
//! - [`Chunk`]: bounded, positioned span of one document
//! - [`Statement`]: atomic, time-bounded factual claim about one entity
//! - [`Entity`]: canonical referent with a controlled type and alias set
//! - [`EntityMention`]: provisional reference awaiting resolution

pub mod chunk;
pub mod document;
pub mod entity;
pub mod mention;
pub mod statement;

pub use chunk::Chunk;
pub use document::{Document, SourceMetadata, TrustLevel};
pub use entity::{Entity, EntityType};
pub use mention::EntityMention;
pub use statement::{Statement, StatementEvent, StatementEventKind, StatementStatus};
