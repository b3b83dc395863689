//! Kernel operations: the generate → analyze → publish → grant → launch
//! pipeline and app lifecycle management.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use lumos_analyzer as analyzer;
use lumos_gateway::{GenerateRequest, GenerationOutcome};
use lumos_registry::NewApp;
use lumos_types::{AnalysisReport, AppEntry, AppType, Capability};
use lumos_wasm::LaunchOptions;

use crate::{Kernel, KernelError};

/// Result of a successful create: the registry entry plus its grant.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedApp {
    /// The published (or deduplicated) entry.
    pub entry: AppEntry,
    /// Whether the code was already registered.
    pub existing: bool,
    /// Analyzer report (warnings surface even on success).
    pub analysis: AnalysisReport,
    /// Capabilities granted.
    pub capabilities: Vec<Capability>,
    /// One bearer token per granted capability.
    pub tokens: BTreeMap<String, String>,
    /// Sanitizer flags reported by the gateway.
    pub sanitizer_flags: Vec<String>,
}

/// Result of create when the prompt was too vague: clarification questions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateOutcome {
    /// An app was generated and registered.
    Created(Box<CreatedApp>),
    /// The gateway asked for clarification; nothing was generated.
    NeedsClarification(lumos_gateway::ClarificationRequest),
}

/// Result of launching a process app.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchedProcess {
    /// Process info from the container manager.
    pub process: lumos_container::ProcessInfo,
    /// Capabilities granted for this run.
    pub capabilities: Vec<Capability>,
}

impl Kernel {
    /// Generate, vet, register and grant an app from a prompt.
    ///
    /// The execution backend is decided by the router (its `type` field is
    /// authoritative when the router model is reachable, the keyword hint
    /// otherwise). No partial generations are persisted: analysis blocks
    /// before anything reaches the registry.
    pub async fn create_app(
        &self,
        prompt: &str,
        request: GenerateRequest,
    ) -> Result<CreateOutcome, KernelError> {
        if prompt.trim().is_empty() {
            return Err(KernelError::Validation("prompt must not be empty".into()));
        }
        if prompt.len() > lumos_types::MAX_PROMPT_LEN {
            return Err(KernelError::Validation("prompt too long".into()));
        }

        let decision = self.router.route(prompt).await;
        match decision.app_type {
            AppType::Process => self.create_process_app(prompt).await,
            _ => self.create_iframe_app(prompt, request).await,
        }
    }

    async fn create_iframe_app(
        &self,
        prompt: &str,
        request: GenerateRequest,
    ) -> Result<CreateOutcome, KernelError> {
        let generated = match self.gateway.generate(prompt, request).await? {
            GenerationOutcome::Generated(result) => result,
            GenerationOutcome::NeedsClarification(clarification) => {
                return Ok(CreateOutcome::NeedsClarification(clarification));
            }
        };

        let analysis = analyzer::analyze(&generated.code);
        if !analysis.passed {
            return Err(KernelError::AnalysisBlocked { report: analysis });
        }

        let published = self
            .registry
            .publish(NewApp {
                prompt: prompt.to_string(),
                title: title_from_prompt(prompt),
                app_type: AppType::Iframe,
                code: generated.code,
                dockerfile: None,
                capabilities: generated.capabilities.clone(),
                model: generated.model,
                provider: generated.provider,
                tags: Vec::new(),
            })
            .await?;

        let grant = self
            .capabilities
            .grant(&published.hash, &generated.capabilities)?;

        info!(hash = %published.hash, existing = published.existing, "iframe app created");
        Ok(CreateOutcome::Created(Box::new(CreatedApp {
            entry: published.entry,
            existing: published.existing,
            analysis,
            capabilities: grant.capabilities,
            tokens: grant.tokens,
            sanitizer_flags: generated.sanitizer_flags,
        })))
    }

    async fn create_process_app(&self, prompt: &str) -> Result<CreateOutcome, KernelError> {
        let generated = self.gateway.generate_process(prompt).await?;

        let recipe_analysis = analyzer::analyze_recipe(&generated.dockerfile);
        if !recipe_analysis.passed {
            return Err(KernelError::AnalysisBlocked { report: recipe_analysis });
        }
        let code_analysis = analyzer::analyze(&generated.code);
        if !code_analysis.passed {
            return Err(KernelError::AnalysisBlocked { report: code_analysis });
        }

        let published = self
            .registry
            .publish(NewApp {
                prompt: prompt.to_string(),
                title: title_from_prompt(prompt),
                app_type: AppType::Process,
                code: generated.code,
                dockerfile: Some(generated.dockerfile),
                capabilities: generated.capabilities.clone(),
                model: generated.model,
                provider: generated.provider,
                tags: Vec::new(),
            })
            .await?;

        let grant = self
            .capabilities
            .grant(&published.hash, &generated.capabilities)?;

        // Both reports surface; the recipe's findings are the interesting
        // ones for process apps.
        let mut analysis = recipe_analysis;
        analysis.findings.extend(code_analysis.findings);
        analysis.warning_count += code_analysis.warning_count;

        info!(hash = %published.hash, existing = published.existing, "process app created");
        Ok(CreateOutcome::Created(Box::new(CreatedApp {
            entry: published.entry,
            existing: published.existing,
            analysis,
            capabilities: grant.capabilities,
            tokens: grant.tokens,
            sanitizer_flags: generated.sanitizer_flags,
        })))
    }

    /// Launch a registered WASM app into the compute sandbox with a fresh
    /// token set.
    pub async fn launch_wasm(
        &self,
        hash: &str,
        options: LaunchOptions,
    ) -> Result<Option<i32>, KernelError> {
        let entry = self
            .registry
            .get(hash)
            .await
            .ok_or_else(|| KernelError::NotFound(hash.to_string()))?;
        if entry.app_type != AppType::Wasm {
            return Err(KernelError::Validation(format!(
                "{hash} is a {} app, not wasm",
                entry.app_type
            )));
        }

        // Registry code for wasm apps is WAT text; parse_bytes also passes
        // raw binaries through untouched.
        let wasm_bytes = wat::parse_bytes(entry.code.as_bytes())
            .map_err(|e| KernelError::Validation(format!("wasm source: {e}")))?
            .into_owned();

        let grant = self.capabilities.grant(hash, &entry.capabilities)?;
        self.registry.record_launch(hash).await?;
        let result = self
            .wasm
            .launch(hash, wasm_bytes, grant.capabilities, &entry.title, options)
            .await;

        // Tokens die with the run, success or not.
        if result.is_err() {
            self.capabilities.revoke_all(hash);
        }
        Ok(result?)
    }

    /// Build a registered process app's image without launching it. Returns
    /// the image name.
    pub async fn build_process(&self, hash: &str) -> Result<String, KernelError> {
        let containers = self
            .containers
            .as_ref()
            .ok_or(KernelError::ContainersDisabled)?;

        let entry = self
            .registry
            .get(hash)
            .await
            .ok_or_else(|| KernelError::NotFound(hash.to_string()))?;
        let recipe = entry
            .dockerfile
            .as_deref()
            .ok_or_else(|| KernelError::Validation(format!("{hash} has no container recipe")))?;

        let analysis = analyzer::analyze_recipe(recipe);
        if !analysis.passed {
            return Err(KernelError::AnalysisBlocked { report: analysis });
        }

        Ok(containers
            .build_image(hash, recipe, &[("app.js".to_string(), entry.code.clone())])
            .await?)
    }

    /// Build and launch a registered process app with a fresh grant.
    pub async fn launch_process(&self, hash: &str) -> Result<LaunchedProcess, KernelError> {
        // Recipes are re-vetted inside the build: registry content may
        // predate a rule added since publish.
        let image = self.build_process(hash).await?;
        let containers = self
            .containers
            .as_ref()
            .ok_or(KernelError::ContainersDisabled)?;
        let entry = self
            .registry
            .get(hash)
            .await
            .ok_or_else(|| KernelError::NotFound(hash.to_string()))?;

        let grant = self.capabilities.grant(hash, &entry.capabilities)?;
        let process = match containers.launch(hash, &image, &grant.capabilities).await {
            Ok(process) => process,
            Err(e) => {
                self.capabilities.revoke_all(hash);
                return Err(e.into());
            }
        };
        self.registry.record_launch(hash).await?;

        Ok(LaunchedProcess { process, capabilities: grant.capabilities })
    }

    /// Kill an app in whichever sandbox hosts it, revoking its tokens.
    pub async fn kill_app(&self, app_id: &str) -> Result<(), KernelError> {
        let mut hit = self.wasm.kill(app_id);
        if let Some(containers) = &self.containers {
            if containers.stop(app_id).await.is_ok() {
                hit = true;
            }
        }
        self.capabilities.revoke_all(app_id);
        if hit {
            Ok(())
        } else {
            Err(KernelError::NotFound(app_id.to_string()))
        }
    }
}

/// Derive a display title from the prompt: first few words, title-cased.
fn title_from_prompt(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().take(6).collect();
    let mut title = words.join(" ");
    if let Some(first) = title.get(0..1) {
        title = format!("{}{}", first.to_uppercase(), &title[1..]);
    }
    title
}
