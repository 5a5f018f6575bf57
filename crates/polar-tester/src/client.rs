//! Model client abstraction and an OpenAI-compatible chat-completions client.
//!
//! The generation loop only sees [`ModelClient`]; [`ChatClient`] is the
//! production implementation that talks to any endpoint speaking the
//! `/v1/chat/completions` wire format (OpenAI, OpenRouter, local gateways).

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::prompt::GenerationRequest;

/// Default chat-completions endpoint.
pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Default model for policy generation.
pub const DEFAULT_MODEL: &str = "gpt-4";

/// Models offered by `polar-tester list-models`.
pub const KNOWN_MODELS: &[&str] = &[
    "gpt-4",
    "gpt-4-turbo",
    "gpt-4o",
    "gpt-4.1",
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-16k",
];

/// Boxed future returned by [`ModelClient::complete`].
pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<Completion>> + Send + 'a>>;

/// A language model that turns a [`GenerationRequest`] into text.
///
/// Uses a boxed future so that the trait is dyn-compatible.
pub trait ModelClient: Send + Sync {
    fn complete<'a>(&'a self, request: &'a GenerationRequest) -> ModelFuture<'a>;
}

/// Text returned by a model call, with optional accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: Option<String>,
    pub usage: Option<UsageInfo>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

// ── Wire types ─────────────────────────────────────────────────────

/// Role of a chat message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Chat completion request body. Unset optional fields are omitted.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl UsageInfo {
    /// Total tokens, falling back to prompt + completion.
    pub fn total(&self) -> u32 {
        self.total_tokens.unwrap_or_else(|| {
            self.prompt_tokens
                .unwrap_or(0)
                .saturating_add(self.completion_tokens.unwrap_or(0))
        })
    }
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    model: Option<String>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

// ── ChatClient ─────────────────────────────────────────────────────

/// Settings for [`ChatClient`].
#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// HTTP timeout for a single completion.
    pub timeout: Duration,
}

impl ChatClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: OPENAI_CHAT_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            temperature: Some(0.1),
            max_tokens: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Async HTTP client for an OpenAI-compatible chat completions API.
pub struct ChatClient {
    client: reqwest::Client,
    config: ChatClientConfig,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::Configuration("model API key is empty".into()));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("polar-tester/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ChatClientConfig {
        &self.config
    }

    /// Build the wire request for a generation request, applying overrides.
    pub fn build_body(&self, request: &GenerationRequest) -> ChatRequest {
        let overrides = request.overrides();
        ChatRequest {
            model: overrides
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: vec![
                Message::system(request.system_message()),
                Message::user(request.user_message()),
            ],
            max_tokens: overrides.max_tokens.or(self.config.max_tokens),
            temperature: overrides.temperature.or(self.config.temperature),
        }
    }

    async fn chat(&self, body: &ChatRequest) -> Result<Completion> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={:?}, temp={:?}",
            body.model,
            body.messages.len(),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Model(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Model(format!("failed to read response: {e}")))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(Error::Model(format!("HTTP {status}: {text}")));
        }
        parse_response(&text, &body.model)
    }
}

impl ModelClient for ChatClient {
    fn complete<'a>(&'a self, request: &'a GenerationRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            let body = self.build_body(request);
            self.chat(&body).await
        })
    }
}

/// Parse a chat-completions response body into a [`Completion`].
fn parse_response(text: &str, requested_model: &str) -> Result<Completion> {
    let parsed: RawChatResponse = serde_json::from_str(text)
        .map_err(|e| Error::Model(format!("failed to parse response: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(Error::Model(format!("API error: {}", err.message)));
    }

    if let Some(ref usage) = parsed.usage {
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
            usage.total(),
        );
    }

    let content = parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    Ok(Completion {
        text: content,
        model: Some(parsed.model.unwrap_or_else(|| requested_model.to_string())),
        usage: parsed.usage,
    })
}
