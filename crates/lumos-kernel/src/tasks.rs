//! Built-in background tasks driving self-improvement.
//!
//! Registered at boot but disabled until the user (or profile) enables
//! them. Handlers hold weak kernel references so the task registry never
//! keeps the kernel alive on its own.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;

use lumos_analyzer as analyzer;
use lumos_registry::BrowseQuery;
use lumos_scheduler::{TaskContext, TaskDef, TaskHandler, TaskReport};
use lumos_types::{JsonMap, ModelTask};

use crate::Kernel;

/// Register the built-in task set on the kernel's scheduler.
pub fn register_builtin(kernel: &Arc<Kernel>) {
    let weak = Arc::downgrade(kernel);

    kernel.scheduler.register(TaskDef {
        id: "registry-curation".into(),
        name: "Registry curation".into(),
        description: "Recompute registry statistics and tag usage".into(),
        category: "maintenance".into(),
        requires_llm: false,
        default_interval_ms: 6 * 60 * 60 * 1000,
        handler: Arc::new(RegistryCuration { kernel: weak.clone() }),
    });

    kernel.scheduler.register(TaskDef {
        id: "security-sweep".into(),
        name: "Security sweep".into(),
        description: "Re-analyze every registered app against the current rule set".into(),
        category: "security".into(),
        requires_llm: false,
        default_interval_ms: 24 * 60 * 60 * 1000,
        handler: Arc::new(SecuritySweep { kernel: weak.clone() }),
    });

    kernel.scheduler.register(TaskDef {
        id: "spec-writer".into(),
        name: "Spec writer".into(),
        description: "Write missing markdown specs for registered apps".into(),
        category: "improvement".into(),
        requires_llm: true,
        default_interval_ms: 12 * 60 * 60 * 1000,
        handler: Arc::new(SpecWriter { kernel: weak }),
    });
}

fn upgrade(kernel: &Weak<Kernel>) -> anyhow::Result<Arc<Kernel>> {
    kernel.upgrade().ok_or_else(|| anyhow::anyhow!("kernel gone"))
}

struct RegistryCuration {
    kernel: Weak<Kernel>,
}

#[async_trait]
impl TaskHandler for RegistryCuration {
    async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<TaskReport> {
        let kernel = upgrade(&self.kernel)?;
        let stats = kernel.registry.stats().await;
        let tags = kernel.registry.tags().await;

        let mut report_stats = JsonMap::new();
        report_stats.insert("total".into(), json!(stats.total));
        report_stats.insert("total_launches".into(), json!(stats.total_launches));
        report_stats.insert("tags".into(), json!(tags.len()));

        Ok(TaskReport {
            summary: Some(format!("{} apps, {} tags", stats.total, tags.len())),
            stats: report_stats,
        })
    }
}

struct SecuritySweep {
    kernel: Weak<Kernel>,
}

#[async_trait]
impl TaskHandler for SecuritySweep {
    async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<TaskReport> {
        let kernel = upgrade(&self.kernel)?;
        let page = kernel
            .registry
            .browse(BrowseQuery { limit: usize::MAX, ..Default::default() })
            .await;

        let mut flagged = Vec::new();
        for entry in &page.apps {
            let mut report = analyzer::analyze(&entry.code);
            if let Some(recipe) = &entry.dockerfile {
                let recipe_report = analyzer::analyze_recipe(recipe);
                report.findings.extend(recipe_report.findings);
                report.critical_count += recipe_report.critical_count;
                report.warning_count += recipe_report.warning_count;
                report.passed = report.critical_count == 0;
            }
            if !report.findings.is_empty() {
                flagged.push(json!({
                    "hash": entry.hash,
                    "title": entry.title,
                    "passed": report.passed,
                    "critical": report.critical_count,
                    "warnings": report.warning_count,
                    "findings": report.findings,
                }));
            }
        }

        let dir = kernel.config.data_root.join("security-reports");
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
        let path = dir.join(format!("{stamp}.json"));
        let report = json!({
            "generated_at": Utc::now(),
            "scanned": page.total,
            "flagged": flagged.len(),
            "entries": flagged,
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?).await?;
        debug!(path = %path.display(), "security report written");

        let mut stats = JsonMap::new();
        stats.insert("scanned".into(), json!(page.total));
        stats.insert("flagged".into(), json!(report["flagged"]));
        Ok(TaskReport {
            summary: Some(format!("{} scanned, {} flagged", page.total, report["flagged"])),
            stats,
        })
    }
}

struct SpecWriter {
    kernel: Weak<Kernel>,
}

const SPEC_SYSTEM_PROMPT: &str = "\
You document small generated applications. Given a prompt and source, \
reply with a concise markdown spec: purpose, UI layout, behaviors, stored \
data. No code blocks of the source, no preamble.";

#[async_trait]
impl TaskHandler for SpecWriter {
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<TaskReport> {
        let kernel = upgrade(&self.kernel)?;
        let page = kernel
            .registry
            .browse(BrowseQuery { limit: usize::MAX, ..Default::default() })
            .await;

        let mut written = 0u32;
        for entry in page.apps.iter().filter(|e| e.spec.is_none()) {
            if ctx.get_budget_remaining() == 0 {
                break;
            }
            let mut cut = entry.code.len().min(4000);
            while !entry.code.is_char_boundary(cut) {
                cut -= 1;
            }
            let user = format!(
                "Prompt: {}\n\nSource ({} chars, truncated):\n{}",
                entry.prompt,
                entry.code.len(),
                &entry.code[..cut],
            );
            ctx.track_llm_call();
            match kernel
                .gateway
                .complete_raw(SPEC_SYSTEM_PROMPT, &user, ModelTask::Background)
                .await
            {
                Ok(spec_md) => {
                    kernel.registry.update_spec(&entry.hash, spec_md).await?;
                    written += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut stats = JsonMap::new();
        stats.insert("written".into(), json!(written));
        Ok(TaskReport { summary: Some(format!("{written} specs written")), stats })
    }
}
