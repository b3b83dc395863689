//! Generation knowledge base.
//!
//! A bounded, newest-first log of past generations persisted to
//! `<data_root>/knowledge.json`. The gateway consults it for memory context
//! (similar past prompts get summarized into the system prompt) and records
//! every successful generation back into it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use lumos_registry::similarity::{dice, normalize};
use lumos_types::{Capability, Complexity};

/// Maximum records retained; oldest fall off.
pub const KNOWLEDGE_LIMIT: usize = 200;

/// One remembered generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    /// Original prompt.
    pub prompt: String,
    /// Normalized prompt used for similarity.
    pub normalized_prompt: String,
    /// Provider that served it.
    pub provider: String,
    /// Model that served it.
    pub model: String,
    /// Classified complexity.
    pub complexity: Complexity,
    /// Capabilities the generated code declared.
    pub capabilities: Vec<Capability>,
    /// When the generation happened.
    pub timestamp: DateTime<Utc>,
}

/// Bounded history of past generations.
pub struct KnowledgeBase {
    path: PathBuf,
    records: RwLock<Vec<KnowledgeRecord>>,
}

impl KnowledgeBase {
    /// Open the knowledge base at `path`, tolerating missing or corrupted
    /// files.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "corrupted knowledge.json, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self { path, records: RwLock::new(records) }
    }

    /// Record a generation, trimming to [`KNOWLEDGE_LIMIT`].
    pub async fn record(
        &self,
        prompt: &str,
        provider: &str,
        model: &str,
        complexity: Complexity,
        capabilities: &[Capability],
    ) {
        {
            let mut records = self.records.write().await;
            records.insert(
                0,
                KnowledgeRecord {
                    prompt: prompt.to_string(),
                    normalized_prompt: normalize(prompt),
                    provider: provider.to_string(),
                    model: model.to_string(),
                    complexity,
                    capabilities: capabilities.to_vec(),
                    timestamp: Utc::now(),
                },
            );
            records.truncate(KNOWLEDGE_LIMIT);
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "knowledge persist failed");
        }
    }

    /// Past records similar to `prompt`, best first.
    pub async fn similar(&self, prompt: &str, threshold: f64, limit: usize) -> Vec<KnowledgeRecord> {
        let nq = normalize(prompt);
        let records = self.records.read().await;
        let mut scored: Vec<(f64, &KnowledgeRecord)> = records
            .iter()
            .filter_map(|r| {
                let score = dice(&nq, &r.normalized_prompt);
                (score >= threshold).then_some((score, r))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, r)| r.clone()).collect()
    }

    /// Render a short memory section for the system prompt, or `None` when
    /// nothing similar is known.
    pub async fn memory_context(&self, prompt: &str, threshold: f64, limit: usize) -> Option<String> {
        let similar = self.similar(prompt, threshold, limit).await;
        if similar.is_empty() {
            return None;
        }
        let mut section = String::from(
            "Previously generated apps similar to this request (match their conventions where sensible):\n",
        );
        for record in &similar {
            let caps: Vec<&str> = record.capabilities.iter().map(|c| c.as_str()).collect();
            section.push_str(&format!(
                "- \"{}\" ({}, capabilities: {})\n",
                record.prompt,
                record.complexity,
                caps.join(", ")
            ));
        }
        debug!(count = similar.len(), "memory context attached");
        Some(section)
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the base is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self) -> std::io::Result<()> {
        let serialized = {
            let records = self.records.read().await;
            serde_json::to_vec_pretty(&*records).unwrap_or_default()
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serialized).await
    }
}
