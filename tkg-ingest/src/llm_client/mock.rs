//! Scripted [`LlmClient`] for deterministic runs.
//!
//! Responses are chosen by the first rule whose needles all occur in the
//! last user message. Unmatched requests fall back to the default response, or
//! fail with [`LlmError::EmptyResponse`] when there is none.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::errors::{LlmError, PipelineError, Result};
use crate::utils::text::json_payload;

use super::{LlmClient, Message, Role};

enum Reply {
    Text(String),
    Fail(fn() -> LlmError),
}

struct Rule {
    needles: Vec<String>,
    reply: Reply,
    /// Remaining uses; `None` means unlimited.
    remaining: Option<usize>,
}

/// An [`LlmClient`] answering from a list of `needles → response` rules.
#[derive(Default)]
pub struct ScriptedLlmClient {
    rules: Mutex<Vec<Rule>>,
    fallback: Option<String>,
    delay: Option<Duration>,
    hold: Option<(String, watch::Receiver<bool>)>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `response` whenever the prompt contains `needle`.
    pub fn on(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.push(vec![needle.into()], Reply::Text(response.into()), None)
    }

    /// Answer `response` when the prompt contains every one of `needles`.
    pub fn on_all(self, needles: &[&str], response: impl Into<String>) -> Self {
        let needles = needles.iter().map(|n| n.to_string()).collect();
        self.push(needles, Reply::Text(response.into()), None)
    }

    /// Same as [`on`](Self::on) but only for the first `times` matches.
    pub fn on_times(self, needle: impl Into<String>, response: impl Into<String>, times: usize) -> Self {
        self.push(vec![needle.into()], Reply::Text(response.into()), Some(times))
    }

    /// Fail the first `times` matching requests with the error built by `error`.
    pub fn fail_times(self, needle: impl Into<String>, error: fn() -> LlmError, times: usize) -> Self {
        self.push(vec![needle.into()], Reply::Fail(error), Some(times))
    }

    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Sleep this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Keep requests containing `needle` waiting until `release` turns true.
    pub fn hold_until(mut self, needle: impl Into<String>, release: watch::Receiver<bool>) -> Self {
        self.hold = Some((needle.into(), release));
        self
    }

    fn push(mut self, needles: Vec<String>, reply: Reply, remaining: Option<usize>) -> Self {
        if let Ok(rules) = self.rules.get_mut() {
            rules.push(Rule {
                needles,
                reply,
                remaining,
            });
        }
        self
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Last user message of every request received, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn answer(&self, messages: &[Message]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = last_user(messages).to_string();
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }

        let mut rules = self
            .rules
            .lock()
            .map_err(|_| PipelineError::Llm(LlmError::Transport("script poisoned".into())))?;
        let matched = rules
            .iter_mut()
            .find(|r| r.remaining != Some(0) && r.needles.iter().all(|n| prompt.contains(n.as_str())));

        match matched {
            Some(rule) => {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                match &rule.reply {
                    Reply::Text(text) => Ok(text.clone()),
                    Reply::Fail(error) => Err(PipelineError::Llm(error())),
                }
            }
            None => self
                .fallback
                .clone()
                .ok_or(PipelineError::Llm(LlmError::EmptyResponse)),
        }
    }

    async fn pause(&self, messages: &[Message]) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((needle, release)) = &self.hold {
            if last_user(messages).contains(needle.as_str()) {
                let mut release = release.clone();
                // A dropped sender counts as released.
                let _ = release.wait_for(|open| *open).await;
            }
        }
    }
}

fn last_user(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map_or("", |m| m.content.as_str())
}

impl LlmClient for ScriptedLlmClient {
    async fn generate(&self, messages: &[Message]) -> Result<String> {
        self.pause(messages).await;
        self.answer(messages)
    }

    async fn generate_structured<T>(&self, messages: &[Message]) -> Result<T>
    where
        T: DeserializeOwned + schemars::JsonSchema + Send,
    {
        self.pause(messages).await;
        let text = self.answer(messages)?;
        let json = json_payload(&text);
        Ok(serde_json::from_str(json)?)
    }
}
