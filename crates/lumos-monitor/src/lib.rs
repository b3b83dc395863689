#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-monitor** – Resource monitor, model tiering and prompt routing.
//!
//! The monitor probes the local inference endpoint for its model list,
//! enumerates configured cloud providers, and assigns every model a 1–9
//! capability tier. Model selection maps a task category to a minimum tier
//! and returns the strongest qualifying default model, except for routing,
//! where the *smallest* adequate model wins to keep classification cheap.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use lumos_types::{ModelInfo, ModelTask};

pub mod router;
pub mod tiers;

pub use router::{classify_complexity, PromptRouter, RouteDecision, RouteSource, RouterModel};

/// Deadline for one local-inference probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum tier required per task category.
pub fn min_tier(task: ModelTask) -> u8 {
    match task {
        ModelTask::Route => 2,
        ModelTask::GenerateSimple => 3,
        ModelTask::GenerateMedium => 5,
        ModelTask::GenerateComplex => 7,
        ModelTask::Background => 4,
    }
}

/// Provider endpoints and defaults the monitor knows about.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    /// Local inference endpoint, e.g. `http://localhost:11434`.
    pub ollama_url: Option<String>,
    /// Default local model name.
    pub ollama_model: Option<String>,
    /// Whether an Anthropic key is configured, and its default model.
    pub claude_model: Option<String>,
    /// Whether an OpenAI key is configured, and its default model.
    pub openai_model: Option<String>,
}

impl MonitorConfig {
    /// Read the configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            ollama_url: std::env::var("OLLAMA_URL").ok(),
            ollama_model: std::env::var("OLLAMA_MODEL").ok(),
            claude_model: std::env::var("ANTHROPIC_API_KEY").ok().map(|_| {
                std::env::var("CLAUDE_MODEL").unwrap_or_else(|_| "claude-sonnet-4-5".to_string())
            }),
            openai_model: std::env::var("OPENAI_API_KEY").ok().map(|_| {
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string())
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
    #[serde(default)]
    size: u64,
}

/// Probes providers and answers model-selection queries.
pub struct ResourceMonitor {
    config: MonitorConfig,
    models: RwLock<Vec<ModelInfo>>,
    http: reqwest::Client,
}

impl ResourceMonitor {
    /// Create a monitor. Call [`probe`](Self::probe) before the first
    /// selection, and periodically afterwards.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            models: RwLock::new(Vec::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Probe the local endpoint and enumerate cloud providers, replacing the
    /// model table. Network failures degrade to the cloud-only view.
    pub async fn probe(&self) {
        let mut models = Vec::new();

        if let Some(base) = &self.config.ollama_url {
            match self.fetch_local_models(base).await {
                Ok(local) => {
                    debug!(count = local.len(), "local models probed");
                    models.extend(local);
                }
                Err(e) => warn!(error = %e, "local inference probe failed"),
            }
        }

        if let Some(model) = &self.config.claude_model {
            models.push(ModelInfo {
                name: model.clone(),
                provider: "claude".into(),
                size: 0,
                tier: tiers::assign(model, 0),
                is_default: true,
            });
        }
        if let Some(model) = &self.config.openai_model {
            models.push(ModelInfo {
                name: model.clone(),
                provider: "openai".into(),
                size: 0,
                tier: tiers::assign(model, 0),
                is_default: true,
            });
        }

        info!(count = models.len(), "model table refreshed");
        *self.models.write().await = models;
    }

    async fn fetch_local_models(&self, base: &str) -> anyhow::Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", base.trim_end_matches('/'));
        let tags: OllamaTags = self
            .http
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let default_name = self.config.ollama_model.clone();
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                tier: tiers::assign(&m.name, m.size),
                is_default: default_name
                    .as_deref()
                    .map_or(true, |d| m.name.starts_with(d)),
                name: m.name,
                provider: "ollama".into(),
                size: m.size,
            })
            .collect())
    }

    /// Current model table.
    pub async fn models(&self) -> Vec<ModelInfo> {
        self.models.read().await.clone()
    }

    /// Pick the best model for a task.
    ///
    /// Default models qualifying for the task's minimum tier are preferred;
    /// override-only models are considered only when no default qualifies.
    /// For [`ModelTask::Route`] the smallest adequate model is returned to
    /// save resources; every other task gets the strongest.
    pub async fn best_model(&self, task: ModelTask) -> Option<ModelInfo> {
        let required = min_tier(task);
        let models = self.models.read().await;

        let pick = |candidates: Vec<&ModelInfo>| -> Option<ModelInfo> {
            let mut qualifying: Vec<&ModelInfo> =
                candidates.into_iter().filter(|m| m.tier >= required).collect();
            if qualifying.is_empty() {
                return None;
            }
            qualifying.sort_by_key(|m| m.tier);
            let chosen = match task {
                ModelTask::Route => qualifying.first(),
                _ => qualifying.last(),
            };
            chosen.map(|m| (*m).clone())
        };

        pick(models.iter().filter(|m| m.is_default).collect())
            .or_else(|| pick(models.iter().filter(|m| !m.is_default).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn monitor_with(models: Vec<ModelInfo>) -> ResourceMonitor {
        let monitor = ResourceMonitor::new(MonitorConfig::default());
        *monitor.models.write().await = models;
        monitor
    }

    fn model(name: &str, tier: u8, is_default: bool) -> ModelInfo {
        ModelInfo {
            name: name.into(),
            provider: "test".into(),
            size: 0,
            tier,
            is_default,
        }
    }

    #[tokio::test]
    async fn strongest_default_wins_for_generation() {
        let monitor = monitor_with(vec![
            model("small", 3, true),
            model("big", 8, true),
            model("huge-override", 9, false),
        ])
        .await;
        let chosen = monitor.best_model(ModelTask::GenerateComplex).await.unwrap();
        assert_eq!(chosen.name, "big");
    }

    #[tokio::test]
    async fn smallest_adequate_wins_for_routing() {
        let monitor = monitor_with(vec![
            model("tiny", 1, true),
            model("small", 3, true),
            model("big", 8, true),
        ])
        .await;
        let chosen = monitor.best_model(ModelTask::Route).await.unwrap();
        assert_eq!(chosen.name, "small");
    }

    #[tokio::test]
    async fn overrides_considered_only_without_defaults() {
        let monitor = monitor_with(vec![
            model("weak-default", 2, true),
            model("strong-override", 9, false),
        ])
        .await;
        let chosen = monitor.best_model(ModelTask::GenerateComplex).await.unwrap();
        assert_eq!(chosen.name, "strong-override");
    }

    #[tokio::test]
    async fn no_qualifying_model_is_none() {
        let monitor = monitor_with(vec![model("tiny", 1, true)]).await;
        assert!(monitor.best_model(ModelTask::GenerateComplex).await.is_none());
    }

    #[tokio::test]
    async fn probe_parses_local_tags() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [
                    {"name": "llama3:8b", "size": 4_700_000_000u64},
                    {"name": "tinyllama", "size": 600_000_000u64}
                ]
            })))
            .mount(&server)
            .await;

        let monitor = ResourceMonitor::new(MonitorConfig {
            ollama_url: Some(server.uri()),
            ..Default::default()
        });
        monitor.probe().await;

        let models = monitor.models().await;
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "llama3:8b");
        assert_eq!(models[0].tier, 4);
    }
}
