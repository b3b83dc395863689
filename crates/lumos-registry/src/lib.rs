#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-registry** – Content-addressed store of generated apps.
//!
//! Every published app is keyed by the first 16 hex characters of
//! SHA-256(code). Publishing identical code deduplicates into the existing
//! entry and bumps its launch counter; different code always creates a new
//! entry. The registry persists to `<data_root>/registry.json` (newest
//! first) with a full-file rewrite behind a coarse writer lock.
//!
//! Search is trigram-based: see [`similarity`] for normalization and the
//! Dice coefficient.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use lumos_types::{AppEntry, AppType, Capability, HASH_PREFIX_LEN};

pub mod similarity;
use similarity::{dice, normalize};

/// Default similarity threshold for [`Registry::find_similar`].
pub const SIMILARITY_THRESHOLD: f64 = 0.25;

/// Maximum results returned by [`Registry::search`].
pub const SEARCH_LIMIT: usize = 10;

/// Tag attached to entries imported by community sync.
pub const COMMUNITY_TAG: &str = "source: community";

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No entry with that hash.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Filesystem failure.
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("registry serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Input to [`Registry::publish`].
#[derive(Debug, Clone)]
pub struct NewApp {
    /// Originating prompt.
    pub prompt: String,
    /// Display title.
    pub title: String,
    /// Execution backend.
    pub app_type: AppType,
    /// Generated artifact.
    pub code: String,
    /// Container recipe for process apps.
    pub dockerfile: Option<String>,
    /// Declared capabilities.
    pub capabilities: Vec<Capability>,
    /// Producing model.
    pub model: String,
    /// Producing provider.
    pub provider: String,
    /// Initial tags.
    pub tags: Vec<String>,
}

/// Outcome of a publish.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    /// Content address of the app.
    pub hash: String,
    /// Whether the code was already registered.
    pub existing: bool,
    /// The (possibly updated) entry.
    pub entry: AppEntry,
}

/// Page of browse results.
#[derive(Debug, Clone, Serialize)]
pub struct BrowsePage {
    /// Entries in this page, newest first.
    pub apps: Vec<AppEntry>,
    /// Total entries matching the filter.
    pub total: usize,
    /// Echo of the requested offset.
    pub offset: usize,
}

/// Browse filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrowseQuery {
    /// Entries to skip.
    #[serde(default)]
    pub offset: usize,
    /// Page size; zero means a default of 20.
    #[serde(default)]
    pub limit: usize,
    /// Only entries carrying this tag.
    #[serde(default)]
    pub tag: Option<String>,
    /// Only entries of this type.
    #[serde(default)]
    pub app_type: Option<AppType>,
}

/// One search or similarity hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// The matching entry.
    pub entry: AppEntry,
    /// Dice similarity in `[0, 1]`.
    pub score: f64,
}

/// Tag with usage count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagCount {
    /// The tag.
    pub tag: String,
    /// Number of entries carrying it.
    pub count: usize,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    /// Total entries.
    pub total: usize,
    /// Sum of launch counters.
    pub total_launches: u64,
    /// Entries per execution backend.
    pub iframe: usize,
    /// Entries per execution backend.
    pub process: usize,
    /// Entries per execution backend.
    pub wasm: usize,
}

/// Compute the content address of `code`.
pub fn content_hash(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    hex::encode(digest)[..HASH_PREFIX_LEN].to_string()
}

/// The content-addressed app registry.
pub struct Registry {
    path: PathBuf,
    entries: RwLock<Vec<AppEntry>>,
    http: reqwest::Client,
}

impl Registry {
    /// Open the registry persisted at `path` (usually
    /// `<data_root>/registry.json`). A missing or corrupted file yields an
    /// empty registry with a warning.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<AppEntry>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "corrupted registry.json, starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(error = %e, "unreadable registry.json, starting empty");
                Vec::new()
            }
        };
        info!(count = entries.len(), "registry loaded");
        Self {
            path,
            entries: RwLock::new(entries),
            http: reqwest::Client::new(),
        }
    }

    /// Publish an app. Idempotent by content hash: identical code increments
    /// the existing entry's launch counter instead of duplicating it.
    pub async fn publish(&self, new: NewApp) -> Result<PublishOutcome, RegistryError> {
        let hash = content_hash(&new.code);
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.iter_mut().find(|e| e.hash == hash) {
            existing.launches += 1;
            let entry = existing.clone();
            drop(entries);
            self.persist().await?;
            debug!(%hash, "publish deduplicated");
            return Ok(PublishOutcome { hash, existing: true, entry });
        }

        let entry = AppEntry {
            hash: hash.clone(),
            normalized_prompt: normalize(&new.prompt),
            prompt: new.prompt,
            title: new.title,
            app_type: new.app_type,
            code: new.code,
            dockerfile: new.dockerfile,
            capabilities: new.capabilities,
            model: new.model,
            provider: new.provider,
            launches: 1,
            created_at: Utc::now(),
            tags: new.tags,
            spec: None,
            rating: None,
        };
        entries.insert(0, entry.clone());
        drop(entries);
        self.persist().await?;
        info!(%hash, "app published");
        Ok(PublishOutcome { hash, existing: false, entry })
    }

    /// Fetch an entry by content address.
    pub async fn get(&self, hash: &str) -> Option<AppEntry> {
        self.entries.read().await.iter().find(|e| e.hash == hash).cloned()
    }

    /// Bump the launch counter of an entry.
    pub async fn record_launch(&self, hash: &str) -> Result<u64, RegistryError> {
        let launches = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .iter_mut()
                .find(|e| e.hash == hash)
                .ok_or_else(|| RegistryError::NotFound(hash.to_string()))?;
            entry.launches += 1;
            entry.launches
        };
        self.persist().await?;
        Ok(launches)
    }

    /// Page through entries, newest first, with optional tag/type filters.
    pub async fn browse(&self, query: BrowseQuery) -> BrowsePage {
        let limit = if query.limit == 0 { 20 } else { query.limit };
        let entries = self.entries.read().await;
        let filtered: Vec<&AppEntry> = entries
            .iter()
            .filter(|e| query.tag.as_ref().map_or(true, |t| e.tags.contains(t)))
            .filter(|e| query.app_type.map_or(true, |t| e.app_type == t))
            .collect();
        let total = filtered.len();
        let apps = filtered
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect();
        BrowsePage { apps, total, offset: query.offset }
    }

    /// Trigram search over prompts, titles and tags. At most
    /// [`SEARCH_LIMIT`] results, best first.
    pub async fn search(&self, query: &str) -> Vec<SearchHit> {
        let nq = normalize(query);
        if nq.is_empty() {
            return Vec::new();
        }
        let entries = self.entries.read().await;
        let mut hits: Vec<SearchHit> = entries
            .iter()
            .filter_map(|e| {
                let score = dice(&nq, &e.normalized_prompt)
                    .max(dice(&nq, &normalize(&e.title)))
                    .max(
                        e.tags
                            .iter()
                            .map(|t| dice(&nq, &normalize(t)))
                            .fold(0.0, f64::max),
                    );
                (score > 0.1).then(|| SearchHit { entry: e.clone(), score })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(SEARCH_LIMIT);
        hits
    }

    /// Entries whose normalized prompt is similar to `prompt`.
    pub async fn find_similar(&self, prompt: &str, threshold: f64, limit: usize) -> Vec<SearchHit> {
        let nq = normalize(prompt);
        let entries = self.entries.read().await;
        let mut hits: Vec<SearchHit> = entries
            .iter()
            .filter_map(|e| {
                let score = dice(&nq, &e.normalized_prompt);
                (score >= threshold).then(|| SearchHit { entry: e.clone(), score })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    /// All tags with usage counts, most used first.
    pub async fn tags(&self) -> Vec<TagCount> {
        let entries = self.entries.read().await;
        let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
        for entry in entries.iter() {
            for tag in &entry.tags {
                *counts.entry(tag.clone()).or_default() += 1;
            }
        }
        let mut tags: Vec<TagCount> = counts
            .into_iter()
            .map(|(tag, count)| TagCount { tag, count })
            .collect();
        tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        tags
    }

    /// Aggregate statistics.
    pub async fn stats(&self) -> RegistryStats {
        let entries = self.entries.read().await;
        let mut stats = RegistryStats {
            total: entries.len(),
            total_launches: 0,
            iframe: 0,
            process: 0,
            wasm: 0,
        };
        for entry in entries.iter() {
            stats.total_launches += entry.launches;
            match entry.app_type {
                AppType::Iframe => stats.iframe += 1,
                AppType::Process => stats.process += 1,
                AppType::Wasm => stats.wasm += 1,
            }
        }
        stats
    }

    /// Attach or replace the markdown spec of an entry.
    pub async fn update_spec(&self, hash: &str, spec_md: String) -> Result<(), RegistryError> {
        {
            let mut entries = self.entries.write().await;
            let entry = entries
                .iter_mut()
                .find(|e| e.hash == hash)
                .ok_or_else(|| RegistryError::NotFound(hash.to_string()))?;
            entry.spec = Some(spec_md);
        }
        self.persist().await
    }

    /// Apply a ±1 vote to an entry.
    pub async fn rate(&self, hash: &str, delta: i64) -> Result<i64, RegistryError> {
        let rating = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .iter_mut()
                .find(|e| e.hash == hash)
                .ok_or_else(|| RegistryError::NotFound(hash.to_string()))?;
            let rating = entry.rating.unwrap_or(0) + delta.signum();
            entry.rating = Some(rating);
            rating
        };
        self.persist().await?;
        Ok(rating)
    }

    /// Remove an entry. Registry entries are never garbage-collected
    /// otherwise.
    pub async fn delete(&self, hash: &str) -> Result<(), RegistryError> {
        {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|e| e.hash != hash);
            if entries.len() == before {
                return Err(RegistryError::NotFound(hash.to_string()));
            }
        }
        self.persist().await
    }

    /// Best-effort community sync: fetch a remote index, then each entry not
    /// yet known locally. Failures are logged and swallowed; imported
    /// entries are tagged [`COMMUNITY_TAG`] and local launch counters are
    /// preserved.
    pub async fn sync_community(&self, base_url: &str) -> usize {
        let index_url = format!("{}/index.json", base_url.trim_end_matches('/'));
        let hashes: Vec<String> = match self
            .http
            .get(&index_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => match resp.json().await {
                Ok(hashes) => hashes,
                Err(e) => {
                    debug!(error = %e, "community index unparsable");
                    return 0;
                }
            },
            Err(e) => {
                debug!(error = %e, "community index unreachable");
                return 0;
            }
        };

        let mut imported = 0;
        for hash in hashes {
            if self.get(&hash).await.is_some() {
                continue;
            }
            let entry_url = format!("{}/apps/{}.json", base_url.trim_end_matches('/'), hash);
            let fetched: AppEntry = match self
                .http
                .get(&entry_url)
                .timeout(Duration::from_secs(8))
                .send()
                .await
                .and_then(|r| r.error_for_status())
            {
                Ok(resp) => match resp.json().await {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!(%hash, error = %e, "community entry unparsable");
                        continue;
                    }
                },
                Err(e) => {
                    debug!(%hash, error = %e, "community entry unreachable");
                    continue;
                }
            };
            // Trust the content, not the metadata: recompute the address.
            if content_hash(&fetched.code) != hash {
                debug!(%hash, "community entry hash mismatch, skipped");
                continue;
            }
            let mut entry = fetched;
            entry.launches = 0;
            if !entry.tags.iter().any(|t| t == COMMUNITY_TAG) {
                entry.tags.push(COMMUNITY_TAG.to_string());
            }
            self.entries.write().await.insert(0, entry);
            imported += 1;
        }
        if imported > 0 {
            if let Err(e) = self.persist().await {
                warn!(error = %e, "persist after community sync failed");
            }
            info!(imported, "community sync complete");
        }
        imported
    }

    /// Full-file rewrite of `registry.json`.
    async fn persist(&self) -> Result<(), RegistryError> {
        let serialized = {
            let entries = self.entries.read().await;
            serde_json::to_vec_pretty(&*entries)?
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serialized).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(prompt: &str, code: &str) -> NewApp {
        NewApp {
            prompt: prompt.to_string(),
            title: prompt.to_string(),
            app_type: AppType::Iframe,
            code: code.to_string(),
            dockerfile: None,
            capabilities: vec![Capability::UiWindow],
            model: "test-model".into(),
            provider: "test".into(),
            tags: vec!["utility".into()],
        }
    }

    async fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::open(dir.path().join("registry.json")).await;
        (dir, reg)
    }

    #[tokio::test]
    async fn publish_assigns_content_hash() {
        let (_dir, reg) = registry().await;
        let out = reg.publish(sample("a timer", "<html>t</html>")).await.unwrap();
        assert_eq!(out.hash, content_hash("<html>t</html>"));
        assert_eq!(out.hash.len(), HASH_PREFIX_LEN);
        assert!(!out.existing);
        assert_eq!(reg.get(&out.hash).await.unwrap().hash, out.hash);
    }

    #[tokio::test]
    async fn duplicate_publish_deduplicates_and_counts() {
        let (_dir, reg) = registry().await;
        let first = reg.publish(sample("a timer", "<html>t</html>")).await.unwrap();
        let second = reg.publish(sample("a timer again", "<html>t</html>")).await.unwrap();
        assert!(second.existing);
        assert_eq!(second.hash, first.hash);
        assert_eq!(second.entry.launches, 2);
        assert_eq!(reg.stats().await.total, 1);
    }

    #[tokio::test]
    async fn different_code_gets_new_entry() {
        let (_dir, reg) = registry().await;
        let a = reg.publish(sample("a timer", "<html>a</html>")).await.unwrap();
        let b = reg.publish(sample("a timer", "<html>b</html>")).await.unwrap();
        assert_ne!(a.hash, b.hash);
        assert_eq!(reg.stats().await.total, 2);
    }

    #[tokio::test]
    async fn browse_is_newest_first_with_filters() {
        let (_dir, reg) = registry().await;
        reg.publish(sample("first", "1")).await.unwrap();
        reg.publish(sample("second", "2")).await.unwrap();

        let page = reg.browse(BrowseQuery::default()).await;
        assert_eq!(page.total, 2);
        assert_eq!(page.apps[0].prompt, "second");

        let tagged = reg
            .browse(BrowseQuery { tag: Some("utility".into()), ..Default::default() })
            .await;
        assert_eq!(tagged.total, 2);
        let none = reg
            .browse(BrowseQuery { tag: Some("missing".into()), ..Default::default() })
            .await;
        assert_eq!(none.total, 0);
    }

    #[tokio::test]
    async fn search_finds_similar_prompts() {
        let (_dir, reg) = registry().await;
        reg.publish(sample("a pomodoro timer with breaks", "p")).await.unwrap();
        reg.publish(sample("markdown notes editor", "m")).await.unwrap();

        let hits = reg.search("pomodoro timer").await;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].entry.code, "p");
    }

    #[tokio::test]
    async fn find_similar_respects_threshold() {
        let (_dir, reg) = registry().await;
        reg.publish(sample("a pomodoro timer", "p")).await.unwrap();
        let hits = reg.find_similar("please build a pomodoro timer", 0.25, 3).await;
        assert_eq!(hits.len(), 1);
        let none = reg.find_similar("spreadsheet of expenses", 0.25, 3).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn rate_clamps_to_unit_steps() {
        let (_dir, reg) = registry().await;
        let out = reg.publish(sample("a timer", "t")).await.unwrap();
        assert_eq!(reg.rate(&out.hash, 5).await.unwrap(), 1);
        assert_eq!(reg.rate(&out.hash, -1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let hash = {
            let reg = Registry::open(&path).await;
            reg.publish(sample("a timer", "t")).await.unwrap().hash
        };
        let reg = Registry::open(&path).await;
        assert!(reg.get(&hash).await.is_some());
    }

    #[tokio::test]
    async fn corrupted_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"[{ nope").unwrap();
        let reg = Registry::open(&path).await;
        assert_eq!(reg.stats().await.total, 0);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let (_dir, reg) = registry().await;
        let out = reg.publish(sample("a timer", "t")).await.unwrap();
        reg.delete(&out.hash).await.unwrap();
        assert!(reg.get(&out.hash).await.is_none());
        assert!(matches!(
            reg.delete(&out.hash).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
