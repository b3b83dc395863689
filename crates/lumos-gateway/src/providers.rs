//! LLM provider adapters.
//!
//! Each adapter hides its provider's wire quirks (single-prompt vs. message
//! arrays, header authentication) behind the [`LlmProvider`] trait. API keys
//! live in [`secrecy::Secret`] wrappers and never reach logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

/// Chat roles the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions to the model.
    System,
    /// End-user content.
    User,
    /// Prior model output.
    Assistant,
}

/// One message in a provider exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role.
    pub role: Role,
    /// Message body.
    pub content: String,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// Per-call generation options.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Token budget for the completion.
    pub max_tokens: Option<u32>,
    /// Model override; the provider default applies when absent.
    pub model: Option<String>,
}

/// A pluggable text-completion provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider name used in configuration and results.
    fn name(&self) -> &'static str;

    /// Model used when no override is given.
    fn default_model(&self) -> &str;

    /// Whether the provider is configured well enough to try.
    fn is_available(&self) -> bool;

    /// Run one completion over `messages`.
    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<String>;
}

/// Name → provider map assembled at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    /// Fetch a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    /// All available providers, deterministic order.
    pub fn available(&self) -> Vec<Arc<dyn LlmProvider>> {
        let mut names: Vec<&&'static str> = self.providers.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| self.providers.get(*n))
            .filter(|p| p.is_available())
            .cloned()
            .collect()
    }
}

//─────────────────────────────
//  Anthropic
//─────────────────────────────

/// Anthropic messages-API adapter.
pub struct AnthropicProvider {
    client: Client,
    api_key: Option<Secret<String>>,
    model: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

impl AnthropicProvider {
    /// Build the adapter; `api_key = None` makes it unavailable.
    pub fn new(api_key: Option<Secret<String>>, model: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key,
            model,
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(skip_all, fields(model = %opts.model.as_deref().unwrap_or(&self.model)))]
    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<String> {
        let key = self.api_key.as_ref().context("anthropic key not configured")?;

        // The messages API takes system as a top-level field.
        let system: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let turns: Vec<_> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                json!({
                    "role": if m.role == Role::User { "user" } else { "assistant" },
                    "content": m.content,
                })
            })
            .collect();

        let body = json!({
            "model": opts.model.as_deref().unwrap_or(&self.model),
            "max_tokens": opts.max_tokens.unwrap_or(8192),
            "system": system,
            "messages": turns,
            "temperature": opts.temperature,
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("anthropic API error {status}: {detail}");
        }

        let parsed: AnthropicResponse =
            response.json().await.context("anthropic response unparsable")?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text)
            .collect();
        if text.is_empty() {
            anyhow::bail!("anthropic returned an empty completion");
        }
        debug!(chars = text.len(), "anthropic completion received");
        Ok(text)
    }
}

//─────────────────────────────
//  OpenAI
//─────────────────────────────

/// OpenAI chat-completions adapter; also speaks to compatible endpoints via
/// a custom base URL.
pub struct OpenAiProvider {
    client: Client,
    api_key: Option<Secret<String>>,
    model: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: String,
}

impl OpenAiProvider {
    /// Build the adapter; `api_key = None` makes it unavailable.
    pub fn new(api_key: Option<Secret<String>>, model: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(skip_all, fields(model = %opts.model.as_deref().unwrap_or(&self.model)))]
    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<String> {
        let key = self.api_key.as_ref().context("openai key not configured")?;

        let body = json!({
            "model": opts.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(key.expose_secret())
            .json(&body)
            .send()
            .await
            .context("openai request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("openai API error {status}: {detail}");
        }

        let parsed: OpenAiResponse =
            response.json().await.context("openai response unparsable")?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if text.is_empty() {
            anyhow::bail!("openai returned an empty completion");
        }
        debug!(chars = text.len(), "openai completion received");
        Ok(text)
    }
}

//─────────────────────────────
//  Ollama
//─────────────────────────────

/// Local inference adapter over the Ollama chat API. No credential needed;
/// availability means an endpoint is configured.
pub struct OllamaProvider {
    client: Client,
    base_url: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaProvider {
    /// Build the adapter; `base_url = None` makes it unavailable.
    pub fn new(base_url: Option<String>, model: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_default(),
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn is_available(&self) -> bool {
        self.base_url.is_some()
    }

    #[instrument(skip_all, fields(model = %opts.model.as_deref().unwrap_or(&self.model)))]
    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<String> {
        let base = self.base_url.as_ref().context("ollama endpoint not configured")?;

        let body = json!({
            "model": opts.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": opts.temperature,
                "num_predict": opts.max_tokens,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/chat", base.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .context("ollama request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("ollama API error {status}: {detail}");
        }

        let parsed: OllamaResponse =
            response.json().await.context("ollama response unparsable")?;
        if parsed.message.content.is_empty() {
            anyhow::bail!("ollama returned an empty completion");
        }
        debug!(chars = parsed.message.content.len(), "ollama completion received");
        Ok(parsed.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn anthropic_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "<html>ok</html>"}],
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(
            Some(Secret::new("sk-ant-test".to_string())),
            "claude-test".into(),
        )
        .with_base_url(server.uri());

        let out = provider
            .generate(
                &[ChatMessage::system("sys"), ChatMessage::user("make a thing")],
                &GenerateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, "<html>ok</html>");
    }

    #[tokio::test]
    async fn unconfigured_providers_report_unavailable() {
        assert!(!AnthropicProvider::new(None, "m".into()).is_available());
        assert!(!OpenAiProvider::new(None, "m".into(), None).is_available());
        assert!(!OllamaProvider::new(None, "m".into()).is_available());
    }

    #[tokio::test]
    async fn registry_lists_available_only() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(OllamaProvider::new(
            Some("http://localhost:11434".into()),
            "llama3".into(),
        )));
        registry.register(Arc::new(AnthropicProvider::new(None, "m".into())));

        let available = registry.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name(), "ollama");
    }
}
