#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-gateway** – Prompt-to-app generation gateway.
//!
//! The gateway turns a natural-language prompt into a vetted generation
//! result while protecting against prompt injection and wasted tokens. The
//! pipeline, in order: model-hint extraction, sanitation, confidence
//! scoring (clarify instead of generating when too vague), complexity
//! classification, provider selection, memory-context lookup, provider
//! invocation with one automatic fallback, post-processing, and declared
//! capability extraction. Every successful generation lands in the
//! knowledge base.

use std::path::Path;
use std::sync::Arc;

use secrecy::Secret;
use serde::Serialize;
use tracing::{info, warn};

use lumos_monitor::{classify_complexity, ResourceMonitor};
use lumos_types::{Capability, Complexity, ModelTask};

pub mod confidence;
pub mod hints;
pub mod knowledge;
pub mod prompts;
pub mod providers;
pub mod sanitizer;

pub use confidence::{ConfidenceReport, CONFIDENCE_THRESHOLD};
pub use hints::ModelHint;
pub use knowledge::KnowledgeBase;
pub use providers::{
    AnthropicProvider, ChatMessage, GenerateOptions, LlmProvider, OllamaProvider, OpenAiProvider,
    ProviderRegistry,
};
pub use sanitizer::SanitizedPrompt;

/// Similarity threshold for memory-context lookup.
const MEMORY_THRESHOLD: f64 = 0.25;

/// Maximum similar prompts pulled into the memory section.
const MEMORY_LIMIT: usize = 3;

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No provider is configured and reachable.
    #[error("no_provider_available")]
    NoProviderAvailable,
    /// The provider (and its fallback, if any) failed.
    #[error("provider_failed: {provider}: {message}")]
    ProviderFailed {
        /// Provider that produced the final failure.
        provider: &'static str,
        /// Underlying error text.
        message: String,
    },
    /// Process output was missing its section markers.
    #[error("malformed_process_output")]
    MalformedProcessOutput,
}

/// Environment-driven gateway configuration.
#[derive(Clone, Default)]
pub struct GatewayConfig {
    /// Local inference endpoint.
    pub ollama_url: Option<String>,
    /// Default local model.
    pub ollama_model: String,
    /// Anthropic credential.
    pub anthropic_key: Option<Secret<String>>,
    /// Default Anthropic model.
    pub claude_model: String,
    /// OpenAI credential.
    pub openai_key: Option<Secret<String>>,
    /// OpenAI-compatible base URL override.
    pub openai_base_url: Option<String>,
    /// Default OpenAI model.
    pub openai_model: String,
    /// Hard provider override from configuration; beats dynamic selection,
    /// loses to an explicit user hint.
    pub provider_override: Option<String>,
    /// Provider tried when the selected one fails.
    pub fallback_provider: Option<String>,
}

impl GatewayConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            ollama_url: std::env::var("OLLAMA_URL").ok(),
            ollama_model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3".into()),
            anthropic_key: std::env::var("ANTHROPIC_API_KEY").ok().map(Secret::new),
            claude_model: std::env::var("CLAUDE_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5".into()),
            openai_key: std::env::var("OPENAI_API_KEY").ok().map(Secret::new),
            openai_base_url: std::env::var("OPENAI_BASE_URL").ok(),
            openai_model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            provider_override: std::env::var("LUMOS_PROVIDER").ok(),
            fallback_provider: std::env::var("LUMOS_FALLBACK_PROVIDER").ok(),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// Skip the confidence gate.
    pub force: bool,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Completion token budget.
    pub max_tokens: Option<u32>,
}

/// A successful generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    /// The post-processed artifact.
    pub code: String,
    /// Capabilities the artifact declares on line one.
    pub capabilities: Vec<Capability>,
    /// Provider that served the request.
    pub provider: String,
    /// Model that served the request.
    pub model: String,
    /// Classified complexity.
    pub complexity: Complexity,
    /// Confidence score of the prompt.
    pub confidence: f64,
    /// Sanitizer patterns that fired (informational, never fatal).
    pub sanitizer_flags: Vec<String>,
    /// The user's model hint, when one was given.
    pub model_hint: Option<String>,
}

/// Returned instead of a generation when the prompt is too vague.
#[derive(Debug, Clone, Serialize)]
pub struct ClarificationRequest {
    /// Up to three questions targeting the weakest score components.
    pub questions: Vec<String>,
    /// The failing confidence score.
    pub confidence: f64,
}

/// Either a generation or a request for clarification.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerationOutcome {
    /// The artifact was generated.
    Generated(GenerationResult),
    /// The prompt needs clarification first; no LLM was called.
    NeedsClarification(ClarificationRequest),
}

/// A successful process (container) generation.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessGenerationResult {
    /// Container build recipe, capabilities comment on line 1.
    pub dockerfile: String,
    /// Application source.
    pub code: String,
    /// Capabilities declared by the recipe.
    pub capabilities: Vec<Capability>,
    /// Provider that served the request.
    pub provider: String,
    /// Model that served the request.
    pub model: String,
    /// Sanitizer patterns that fired.
    pub sanitizer_flags: Vec<String>,
}

/// The generation gateway.
pub struct Gateway {
    config: GatewayConfig,
    registry: ProviderRegistry,
    monitor: Arc<ResourceMonitor>,
    knowledge: KnowledgeBase,
}

impl Gateway {
    /// Build a gateway: providers from `config`, knowledge base under
    /// `data_root`.
    pub async fn new(
        config: GatewayConfig,
        monitor: Arc<ResourceMonitor>,
        data_root: &Path,
    ) -> Self {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(OllamaProvider::new(
            config.ollama_url.clone(),
            config.ollama_model.clone(),
        )));
        registry.register(Arc::new(AnthropicProvider::new(
            config.anthropic_key.clone(),
            config.claude_model.clone(),
        )));
        registry.register(Arc::new(OpenAiProvider::new(
            config.openai_key.clone(),
            config.openai_model.clone(),
            config.openai_base_url.clone(),
        )));
        let knowledge = KnowledgeBase::open(data_root.join("knowledge.json")).await;
        Self { config, registry, monitor, knowledge }
    }

    /// Build a gateway over an explicit provider registry (tests, embedders).
    pub async fn with_registry(
        config: GatewayConfig,
        registry: ProviderRegistry,
        monitor: Arc<ResourceMonitor>,
        data_root: &Path,
    ) -> Self {
        let knowledge = KnowledgeBase::open(data_root.join("knowledge.json")).await;
        Self { config, registry, monitor, knowledge }
    }

    /// Access the knowledge base.
    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    /// Generate an iframe (HTML document) app.
    pub async fn generate(
        &self,
        prompt: &str,
        request: GenerateRequest,
    ) -> Result<GenerationOutcome, GatewayError> {
        let (stripped, hint) = hints::extract_model_hint(prompt);
        let sanitized = sanitizer::sanitize(&stripped);

        let report = confidence::score(&sanitized.text);
        if !report.passes() && !request.force {
            info!(score = report.score, "prompt below confidence threshold");
            return Ok(GenerationOutcome::NeedsClarification(ClarificationRequest {
                questions: confidence::questions(&report),
                confidence: report.score,
            }));
        }

        let complexity = classify_complexity(&sanitized.text);
        let (provider, model_override) = self.select_provider(&hint, complexity).await?;

        let mut system = prompts::IFRAME_SYSTEM_PROMPT.to_string();
        if let Some(memory) = self
            .knowledge
            .memory_context(&sanitized.text, MEMORY_THRESHOLD, MEMORY_LIMIT)
            .await
        {
            system.push_str("\n\n");
            system.push_str(&memory);
        }

        let messages = [ChatMessage::system(system), ChatMessage::user(&sanitized.text)];
        let opts = GenerateOptions {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            model: model_override.clone(),
        };

        let (raw, provider_name, model_name) =
            self.invoke_with_fallback(provider, &messages, &opts).await?;

        let code = prompts::post_process(&raw);
        let capabilities = prompts::extract_capabilities(&code);

        self.knowledge
            .record(&sanitized.text, provider_name, &model_name, complexity, &capabilities)
            .await;

        Ok(GenerationOutcome::Generated(GenerationResult {
            code,
            capabilities,
            provider: provider_name.to_string(),
            model: model_name,
            complexity,
            confidence: report.score,
            sanitizer_flags: sanitized.flags,
            model_hint: hint.map(|h| h.provider.to_string()),
        }))
    }

    /// Generate a process app: container recipe plus code.
    pub async fn generate_process(
        &self,
        prompt: &str,
    ) -> Result<ProcessGenerationResult, GatewayError> {
        let (stripped, hint) = hints::extract_model_hint(prompt);
        let sanitized = sanitizer::sanitize(&stripped);
        let complexity = classify_complexity(&sanitized.text);
        let (provider, model_override) = self.select_provider(&hint, complexity).await?;

        let messages = [
            ChatMessage::system(prompts::PROCESS_SYSTEM_PROMPT),
            ChatMessage::user(&sanitized.text),
        ];
        let opts = GenerateOptions { model: model_override, ..Default::default() };

        let (raw, provider_name, model_name) =
            self.invoke_with_fallback(provider, &messages, &opts).await?;

        let sections =
            prompts::parse_process_output(&raw).ok_or(GatewayError::MalformedProcessOutput)?;
        let capabilities = prompts::extract_capabilities(&sections.dockerfile);

        self.knowledge
            .record(&sanitized.text, provider_name, &model_name, complexity, &capabilities)
            .await;

        Ok(ProcessGenerationResult {
            dockerfile: sections.dockerfile,
            code: sections.code,
            capabilities,
            provider: provider_name.to_string(),
            model: model_name,
            sanitizer_flags: sanitized.flags,
        })
    }

    /// Raw completion for collaborators that are not generating apps: the
    /// prompt router and background tasks. Provider selection uses the
    /// monitor's best model for `task`, then the static fallback chain; one
    /// automatic provider fallback applies as everywhere else.
    pub async fn complete_raw(
        &self,
        system: &str,
        user: &str,
        task: ModelTask,
    ) -> Result<String, GatewayError> {
        let provider_and_model = match self.monitor.best_model(task).await {
            Some(model) => self
                .registry
                .get(&model.provider)
                .filter(|p| p.is_available())
                .map(|p| (p, Some(model.name))),
            None => None,
        };
        let (provider, model) = match provider_and_model {
            Some(found) => found,
            None => {
                let provider = self
                    .registry
                    .available()
                    .into_iter()
                    .next()
                    .ok_or(GatewayError::NoProviderAvailable)?;
                (provider, None)
            }
        };

        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let opts = GenerateOptions { model, ..Default::default() };
        let (raw, _, _) = self.invoke_with_fallback(provider, &messages, &opts).await?;
        Ok(raw)
    }

    /// Provider selection precedence: user hint, config override, monitor
    /// best-for-task, static fallback.
    async fn select_provider(
        &self,
        hint: &Option<ModelHint>,
        complexity: Complexity,
    ) -> Result<(Arc<dyn LlmProvider>, Option<String>), GatewayError> {
        if let Some(hint) = hint {
            if let Some(provider) = self.registry.get(hint.provider).filter(|p| p.is_available()) {
                return Ok((provider, hint.model.map(|m| m.to_string())));
            }
            warn!(provider = hint.provider, "hinted provider unavailable, falling through");
        }

        if let Some(name) = &self.config.provider_override {
            if let Some(provider) = self.registry.get(name).filter(|p| p.is_available()) {
                return Ok((provider, None));
            }
            warn!(provider = %name, "configured provider unavailable, falling through");
        }

        let task = match complexity {
            Complexity::Simple => ModelTask::GenerateSimple,
            Complexity::Medium => ModelTask::GenerateMedium,
            Complexity::Complex => ModelTask::GenerateComplex,
        };
        if let Some(model) = self.monitor.best_model(task).await {
            if let Some(provider) =
                self.registry.get(&model.provider).filter(|p| p.is_available())
            {
                return Ok((provider, Some(model.name)));
            }
        }

        // Static fallback: strong cloud model for complex work, local first
        // otherwise.
        let order: &[&str] = match complexity {
            Complexity::Complex => &["claude", "openai", "ollama"],
            _ => &["ollama", "claude", "openai"],
        };
        for name in order {
            if let Some(provider) = self.registry.get(name).filter(|p| p.is_available()) {
                return Ok((provider, None));
            }
        }
        Err(GatewayError::NoProviderAvailable)
    }

    /// Invoke the provider; on failure, try exactly one fallback.
    async fn invoke_with_fallback(
        &self,
        provider: Arc<dyn LlmProvider>,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> Result<(String, &'static str, String), GatewayError> {
        let model_name = opts
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());

        let primary_error = match provider.generate(messages, opts).await {
            Ok(raw) => return Ok((raw, provider.name(), model_name)),
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "provider failed, trying fallback");
                e
            }
        };

        let fallback = self
            .config
            .fallback_provider
            .as_ref()
            .and_then(|name| self.registry.get(name))
            .filter(|p| p.is_available() && p.name() != provider.name())
            .or_else(|| {
                self.registry
                    .available()
                    .into_iter()
                    .find(|p| p.name() != provider.name())
            });
        let Some(fallback) = fallback else {
            return Err(GatewayError::ProviderFailed {
                provider: provider.name(),
                message: primary_error.to_string(),
            });
        };

        // The fallback runs with its own default model.
        let fallback_opts = GenerateOptions { model: None, ..opts.clone() };
        match fallback.generate(messages, &fallback_opts).await {
            Ok(raw) => {
                info!(provider = fallback.name(), "fallback provider succeeded");
                Ok((raw, fallback.name(), fallback.default_model().to_string()))
            }
            Err(e) => Err(GatewayError::ProviderFailed {
                provider: fallback.name(),
                message: e.to_string(),
            }),
        }
    }
}
