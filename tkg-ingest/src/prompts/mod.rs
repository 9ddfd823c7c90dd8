//! Prompt templates and typed responses for the LLM-backed stages.
//!
//! Prompts are stored as Rust string literals (not external files) for
//! compile-time inclusion. Each submodule pairs a message builder with the
//! `JsonSchema` response type the model is constrained to.

pub mod extract_entities;
pub mod extract_statements;
pub mod invalidate;

use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamps are shown to the model as RFC 3339, second precision.
pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
