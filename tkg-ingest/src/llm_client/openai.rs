//! [`LlmClient`] backed by OpenAI chat completions.
//!
//! Requests go through `async-openai`'s bring-your-own-types endpoint so the
//! JSON-schema response format can be passed as-is. Answers are cached in a
//! `moka` cache keyed by an MD5 digest of model, target type and messages.
//! Rate limits and 5xx answers are retried under a [`ClientBackoff`].

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{LlmError, PipelineError, Result};
use crate::types::PipelineConfig;
use crate::utils::retry::ClientBackoff;
use crate::utils::text::json_payload;

use super::{LlmClient, Message};

/// Capacity and lifetime of cached answers.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_capacity: u64,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1_000,
            ttl: Duration::from_secs(3_600),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    refusal: Option<String>,
}

impl ChatResponse {
    /// Text of the first choice. A refusal is its own error so the item goes
    /// to review instead of being retried.
    fn into_text(self) -> Result<String> {
        let message = self
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or(PipelineError::Llm(LlmError::EmptyResponse))?;
        if message.refusal.as_deref().is_some_and(|r| !r.trim().is_empty()) {
            return Err(PipelineError::Llm(LlmError::Refusal));
        }
        message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or(PipelineError::Llm(LlmError::EmptyResponse))
    }
}

fn cache_key(model: &str, kind: &str, messages: &[Message]) -> String {
    use md5::{Digest, Md5};
    let mut digest = Md5::new();
    for part in [kind, model] {
        digest.update(part.as_bytes());
        digest.update([0u8]);
    }
    for m in messages {
        digest.update(m.role.as_str().as_bytes());
        digest.update([0u8]);
        digest.update(m.content.as_bytes());
        digest.update([0u8]);
    }
    format!("{:x}", digest.finalize())
}

pub struct OpenAiClient {
    client: async_openai::Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    backoff: ClientBackoff,
    cache: Cache<String, String>,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, cache: CacheConfig) -> Self {
        Self::with_openai_config(OpenAIConfig::new().with_api_key(api_key), model, cache)
    }

    /// Client for `TKG_MODEL_NAME`, backing off within the per-call timeout.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.openai_api_key.clone(),
            config.model_name.clone(),
            CacheConfig::default(),
        )
        .with_backoff(config.client_backoff())
    }

    fn with_openai_config(config: OpenAIConfig, model: impl Into<String>, cache: CacheConfig) -> Self {
        Self {
            client: async_openai::Client::with_config(config),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 4_096,
            backoff: ClientBackoff::default(),
            cache: Cache::builder()
                .max_capacity(cache.max_capacity)
                .time_to_live(cache.ttl)
                .build(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_backoff(mut self, backoff: ClientBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn complete(&self, messages: &[Message], response_format: Option<Value>) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format,
        };

        let response: ChatResponse = backoff::future::retry(self.backoff.schedule(), || async {
            self.client
                .chat()
                .create_byot(&request)
                .await
                .map_err(|e| {
                    let err = classify(e);
                    if err.is_transient() {
                        warn!(model = %self.model, error = %err, "chat completion failed, backing off");
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
        })
        .await
        .map_err(PipelineError::Llm)?;

        response.into_text()
    }
}

impl LlmClient for OpenAiClient {
    async fn generate(&self, messages: &[Message]) -> Result<String> {
        let key = cache_key(&self.model, "text", messages);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(model = %self.model, "answer served from cache");
            return Ok(hit);
        }

        let text = self.complete(messages, None).await?;
        self.cache.insert(key, text.clone()).await;
        Ok(text)
    }

    async fn generate_structured<T>(&self, messages: &[Message]) -> Result<T>
    where
        T: DeserializeOwned + schemars::JsonSchema + Send,
    {
        // The same prompt asked for two different shapes must not share an entry.
        let target = std::any::type_name::<T>();
        let key = cache_key(&self.model, target, messages);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(model = %self.model, target, "structured answer served from cache");
            return Ok(serde_json::from_str(json_payload(&hit))?);
        }

        let format = json!({
            "type": "json_schema",
            "json_schema": {
                "name": "response",
                "schema": schemars::schema_for!(T),
            }
        });
        let text = self.complete(messages, Some(format)).await?;

        // A malformed answer is not cached, so a retry asks again.
        let parsed: T = serde_json::from_str(json_payload(&text))?;
        self.cache.insert(key, text).await;
        Ok(parsed)
    }
}

/// The API error body carries no HTTP status; classify by `code` and `type`.
fn classify(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => {
            let code = api.code.as_deref().unwrap_or_default();
            let kind = api.r#type.as_deref().unwrap_or_default();
            if code == "invalid_api_key" || kind == "authentication_error" {
                LlmError::Authentication
            } else if code == "rate_limit_exceeded" || matches!(kind, "requests" | "tokens") {
                LlmError::RateLimit
            } else if matches!(kind, "server_error" | "service_unavailable") {
                LlmError::Api {
                    status: 500,
                    message: api.message,
                }
            } else {
                LlmError::Api {
                    status: 400,
                    message: api.message,
                }
            }
        }
        OpenAIError::Reqwest(e) => LlmError::Transport(e.to_string()),
        other => LlmError::Api {
            status: 0,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenAiClient {
        let config = OpenAIConfig::new()
            .with_api_key("sk-test")
            .with_api_base(server.uri());
        OpenAiClient::with_openai_config(config, "gpt-4o", CacheConfig::default()).with_backoff(
            ClientBackoff {
                initial_interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(20),
                max_elapsed: Duration::from_secs(2),
            },
        )
    }

    fn answer(message: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000_u64,
            "model": "gpt-4o",
            "choices": [{ "index": 0, "message": message, "finish_reason": "stop" }],
        }))
    }

    fn text(content: &str) -> ResponseTemplate {
        answer(json!({ "role": "assistant", "content": content }))
    }

    #[derive(Debug, PartialEq, Deserialize, JsonSchema)]
    struct Verdict {
        supersede: bool,
        confidence: f32,
    }

    #[tokio::test]
    async fn text_answers_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(text("Acme owns Beta."))
            .expect(1)
            .mount(&server)
            .await;

        let llm = client(&server);
        let msgs = [Message::system("be brief"), Message::user("Who owns Beta?")];
        assert_eq!(llm.generate(&msgs).await.unwrap(), "Acme owns Beta.");
        assert_eq!(llm.generate(&msgs).await.unwrap(), "Acme owns Beta.");
    }

    #[tokio::test]
    async fn structured_requests_carry_the_schema() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({
                "model": "gpt-4o",
                "messages": [{ "role": "user", "content": "judge" }],
                "response_format": { "type": "json_schema" },
            })))
            .respond_with(text(r#"{"supersede":true,"confidence":0.75}"#))
            .expect(1)
            .mount(&server)
            .await;

        let llm = client(&server);
        let msgs = [Message::user("judge")];
        let first: Verdict = llm.generate_structured(&msgs).await.unwrap();
        let cached: Verdict = llm.generate_structured(&msgs).await.unwrap();
        assert_eq!(first, Verdict { supersede: true, confidence: 0.75 });
        assert_eq!(first, cached);
    }

    #[tokio::test]
    async fn unparseable_answers_are_asked_again() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(text("certainly!"))
            .expect(2)
            .mount(&server)
            .await;

        let llm = client(&server);
        for _ in 0..2 {
            let err = llm
                .generate_structured::<Verdict>(&[Message::user("judge")])
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::Serialization(_)));
            assert!(err.needs_review());
        }
    }

    #[tokio::test]
    async fn refusals_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(answer(json!({
                "role": "assistant",
                "content": null,
                "refusal": "I can't help with that.",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).generate(&[Message::user("?")]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Llm(LlmError::Refusal)));
    }

    #[tokio::test]
    async fn invalid_key_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {
                    "message": "Incorrect API key provided.",
                    "type": "invalid_request_error",
                    "param": null,
                    "code": "invalid_api_key",
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).generate(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Llm(LlmError::Authentication)));
        assert!(!err.is_transient());
    }

    #[test]
    fn cache_keys_separate_kind_model_and_content() {
        let a = [Message::user("hello")];
        let b = [Message::user("world")];
        assert_eq!(cache_key("gpt-4o", "text", &a), cache_key("gpt-4o", "text", &a));
        assert_ne!(cache_key("gpt-4o", "text", &a), cache_key("gpt-4o", "text", &b));
        assert_ne!(cache_key("gpt-4o", "text", &a), cache_key("gpt-4o-mini", "text", &a));
        assert_ne!(cache_key("gpt-4o", "text", &a), cache_key("gpt-4o", "Verdict", &a));
    }

    #[test]
    fn api_errors_are_classified() {
        let api = |code: Option<&str>, kind: Option<&str>| {
            classify(OpenAIError::ApiError(async_openai::error::ApiError {
                message: "x".into(),
                r#type: kind.map(String::from),
                param: None,
                code: code.map(String::from),
            }))
        };
        assert!(matches!(api(Some("rate_limit_exceeded"), None), LlmError::RateLimit));
        assert!(matches!(api(None, Some("tokens")), LlmError::RateLimit));
        assert!(api(None, Some("server_error")).is_transient());
        assert!(!api(None, Some("invalid_request_error")).is_transient());
        assert!(matches!(api(None, Some("authentication_error")), LlmError::Authentication));
    }
}
