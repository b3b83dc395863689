//! Prompt routing: decide execution backend and complexity before generation.
//!
//! When a router model is reachable the prompt is classified by the LLM
//! (JSON-only output, hard 8 s deadline); otherwise a regex/keyword fallback
//! produces the same shape tagged `source: regex`. Router output is
//! authoritative only for `type` and `complexity`; unknown templates and
//! models are dropped rather than trusted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use lumos_types::{AppType, Complexity};

/// Deadline for one router-model call.
pub const ROUTE_TIMEOUT: Duration = Duration::from_secs(8);

/// Templates the shell knows how to seed. Anything else from the router is
/// discarded.
const KNOWN_TEMPLATES: &[&str] = &["timer", "notes", "list", "chart", "form", "game", "dashboard"];

/// Keywords whose presence marks a prompt as complex.
const COMPLEX_KEYWORDS: &[&str] = &[
    "database", "multiplayer", "real-time", "realtime", "authentication", "sync",
    "chart", "graph", "drag", "animation", "3d", "game", "editor", "collaborative",
    "simulation", "websocket", "spreadsheet",
];

static PROCESS_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(server|daemon|service|webhook|bot|scraper?|scrape|cron|database|backend)\b")
        .unwrap()
});

/// Minimal seam the router needs from an LLM: one system-and-user exchange
/// returning raw text. The kernel wires a gateway-backed adapter in.
#[async_trait]
pub trait RouterModel: Send + Sync {
    /// Run one classification exchange.
    async fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String>;
}

/// Where a routing decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    /// The router model classified the prompt.
    Llm,
    /// Keyword fallback.
    Regex,
}

/// A routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    /// Execution backend.
    pub app_type: AppType,
    /// Prompt complexity.
    pub complexity: Complexity,
    /// Suggested title, if the router offered one.
    pub title: Option<String>,
    /// Known template suggestion, if any.
    pub template: Option<String>,
    /// Model suggestion; advisory only.
    pub model: Option<String>,
    /// Origin of this decision.
    pub source: RouteSource,
}

#[derive(Debug, Deserialize)]
struct RouterOutput {
    #[serde(rename = "type")]
    app_type: Option<String>,
    template: Option<String>,
    model: Option<String>,
    complexity: Option<String>,
    title: Option<String>,
}

const ROUTER_SYSTEM_PROMPT: &str = "\
You classify app-generation prompts. Reply with a single JSON object and \
nothing else: {\"type\": \"iframe\"|\"process\", \"template\": string|null, \
\"model\": string|null, \"complexity\": \"simple\"|\"medium\"|\"complex\", \
\"title\": string}. No markdown, no commentary.";

/// Classify prompt complexity from keyword hits and length.
///
/// Two complex-keyword hits or more than 80 words make a prompt complex; one
/// hit or more than 40 words make it medium.
pub fn classify_complexity(prompt: &str) -> Complexity {
    let lower = prompt.to_lowercase();
    let hits = COMPLEX_KEYWORDS.iter().filter(|k| lower.contains(*k)).count();
    let words = prompt.split_whitespace().count();
    if hits >= 2 || words > 80 {
        Complexity::Complex
    } else if hits >= 1 || words > 40 {
        Complexity::Medium
    } else {
        Complexity::Simple
    }
}

/// Routes prompts via a router model with a regex fallback.
pub struct PromptRouter {
    model: Option<Arc<dyn RouterModel>>,
}

impl PromptRouter {
    /// A router that always uses the regex fallback.
    pub fn regex_only() -> Self {
        Self { model: None }
    }

    /// A router backed by `model`, falling back to regex on failure.
    pub fn with_model(model: Arc<dyn RouterModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Classify a prompt. Never fails: any router-model problem degrades to
    /// the regex path.
    pub async fn route(&self, prompt: &str) -> RouteDecision {
        if let Some(model) = &self.model {
            match tokio::time::timeout(ROUTE_TIMEOUT, model.complete(ROUTER_SYSTEM_PROMPT, prompt))
                .await
            {
                Ok(Ok(raw)) => {
                    if let Some(decision) = parse_router_output(&raw, prompt) {
                        return decision;
                    }
                    warn!("router output unparsable, falling back to regex");
                }
                Ok(Err(e)) => warn!(error = %e, "router model failed, falling back to regex"),
                Err(_) => warn!("router model timed out, falling back to regex"),
            }
        }
        self.route_regex(prompt)
    }

    fn route_regex(&self, prompt: &str) -> RouteDecision {
        let app_type = if PROCESS_HINT.is_match(prompt) {
            AppType::Process
        } else {
            AppType::Iframe
        };
        debug!(?app_type, "regex routing");
        RouteDecision {
            app_type,
            complexity: classify_complexity(prompt),
            title: None,
            template: None,
            model: None,
            source: RouteSource::Regex,
        }
    }
}

fn parse_router_output(raw: &str, prompt: &str) -> Option<RouteDecision> {
    // Models occasionally wrap JSON in fences despite instructions.
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    let output: RouterOutput = serde_json::from_str(body).ok()?;

    let app_type = match output.app_type.as_deref() {
        Some("iframe") => AppType::Iframe,
        Some("process") => AppType::Process,
        _ => return None,
    };
    let complexity = match output.complexity.as_deref() {
        Some("simple") => Complexity::Simple,
        Some("medium") => Complexity::Medium,
        Some("complex") => Complexity::Complex,
        // Complexity is required for a decision we call authoritative.
        _ => classify_complexity(prompt),
    };
    let template = output
        .template
        .filter(|t| KNOWN_TEMPLATES.contains(&t.as_str()));

    Some(RouteDecision {
        app_type,
        complexity,
        title: output.title,
        template,
        model: output.model,
        source: RouteSource::Llm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedModel(String);

    #[async_trait]
    impl RouterModel for FixedModel {
        async fn complete(&self, _system: &str, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl RouterModel for FailingModel {
        async fn complete(&self, _system: &str, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("unreachable")
        }
    }

    #[test]
    fn complexity_thresholds() {
        assert_eq!(classify_complexity("a clock"), Complexity::Simple);
        assert_eq!(classify_complexity("a chart of my day"), Complexity::Medium);
        assert_eq!(
            classify_complexity("a multiplayer game with real-time sync"),
            Complexity::Complex
        );
        let long = "word ".repeat(81);
        assert_eq!(classify_complexity(&long), Complexity::Complex);
    }

    #[tokio::test]
    async fn llm_route_parses_json() {
        let router = PromptRouter::with_model(Arc::new(FixedModel(
            r#"{"type":"process","template":"timer","model":"x","complexity":"medium","title":"RSS Bot"}"#.into(),
        )));
        let decision = router.route("an rss bot").await;
        assert_eq!(decision.app_type, AppType::Process);
        assert_eq!(decision.complexity, Complexity::Medium);
        assert_eq!(decision.source, RouteSource::Llm);
        assert_eq!(decision.template.as_deref(), Some("timer"));
    }

    #[tokio::test]
    async fn unknown_template_is_dropped() {
        let router = PromptRouter::with_model(Arc::new(FixedModel(
            r#"{"type":"iframe","template":"quantum","complexity":"simple","title":"T"}"#.into(),
        )));
        let decision = router.route("x").await;
        assert_eq!(decision.template, None);
    }

    #[tokio::test]
    async fn fenced_json_is_accepted() {
        let router = PromptRouter::with_model(Arc::new(FixedModel(
            "```json\n{\"type\":\"iframe\",\"complexity\":\"simple\",\"title\":\"T\"}\n```".into(),
        )));
        let decision = router.route("a clock").await;
        assert_eq!(decision.source, RouteSource::Llm);
        assert_eq!(decision.app_type, AppType::Iframe);
    }

    #[tokio::test]
    async fn failing_model_falls_back_to_regex() {
        let router = PromptRouter::with_model(Arc::new(FailingModel));
        let decision = router.route("a web scraper bot").await;
        assert_eq!(decision.source, RouteSource::Regex);
        assert_eq!(decision.app_type, AppType::Process);
    }

    #[tokio::test]
    async fn regex_only_router_is_well_formed() {
        let router = PromptRouter::regex_only();
        let decision = router.route("a color picker").await;
        assert_eq!(decision.source, RouteSource::Regex);
        assert_eq!(decision.app_type, AppType::Iframe);
    }
}
