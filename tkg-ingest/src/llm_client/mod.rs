//! Text-generation capability.
//!
//! # Implementations
//! - [`openai::OpenAiClient`]: chat completions via `async-openai`.
//! - [`mock::ScriptedLlmClient`]: rule-scripted responses for tests and dry runs.

pub mod mock;
pub mod openai;

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::Result;

/// One turn of a prompt.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Text generation used by the extraction and invalidation stages.
///
/// Implementations classify their own failures: a [`crate::errors::LlmError`]
/// that reports itself transient is retried by the calling stage, anything
/// else is final for the item.
pub trait LlmClient: Send + Sync {
    /// Free-text answer to `messages`.
    fn generate(&self, messages: &[Message]) -> impl Future<Output = Result<String>> + Send;

    /// Answer decoded as `T`. The schema of `T` is offered to the model, and
    /// an answer that does not decode is a serialization error.
    fn generate_structured<T>(&self, messages: &[Message]) -> impl Future<Output = Result<T>> + Send
    where
        T: DeserializeOwned + schemars::JsonSchema + Send;
}
