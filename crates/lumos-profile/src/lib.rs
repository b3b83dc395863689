#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-profile** – User profile and boot-mode snapshots.
//!
//! The profile is a user-editable YAML record at `<data_root>/profile.yaml`
//! deciding, among shell and service preferences, whether the OS is
//! *ephemeral* (apps regenerate on boot) or *solidified* (frozen artifacts
//! are reused). `solidify` freezes the current apps and shell under
//! `<data_root>/snapshot/`; snapshots store only textual artifacts (code,
//! recipe, metadata) and images are rebuilt on resume.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use lumos_types::AppEntry;

/// Profile errors.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// Filesystem failure.
    #[error("profile io: {0}")]
    Io(#[from] std::io::Error),
    /// YAML (de)serialization failure.
    #[error("profile yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// JSON (de)serialization failure.
    #[error("profile json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Boot mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Regenerate apps on every boot.
    Ephemeral,
    /// Reuse frozen artifacts from the snapshot.
    Solidified,
}

/// Shell preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell theme name.
    pub theme: String,
    /// Accent color.
    pub accent: String,
    /// Whether the dock is shown.
    pub dock: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self { theme: "dark".into(), accent: "#7c6af2".into(), dock: true }
    }
}

/// Service toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Services {
    /// SSH access into the host container.
    pub ssh: bool,
    /// Local inference service.
    pub ollama: bool,
    /// Background task scheduler.
    pub scheduler: bool,
}

impl Default for Services {
    fn default() -> Self {
        Self { ssh: false, ollama: true, scheduler: true }
    }
}

/// Security policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    /// Whether sandboxing is enforced (diagnostics only when false).
    pub sandbox: bool,
    /// Whether generated apps may ever receive network capabilities.
    pub network: bool,
    /// Cap on capabilities granted to a single app.
    pub max_capabilities: usize,
}

impl Default for Security {
    fn default() -> Self {
        Self { sandbox: true, network: true, max_capabilities: 6 }
    }
}

/// LLM preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmPrefs {
    /// Preferred provider, if pinned.
    pub provider: Option<String>,
    /// Preferred model, if pinned.
    pub model: Option<String>,
}

/// The user-editable profile record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Boot mode.
    pub mode: Mode,
    /// Display name.
    pub name: String,
    /// BCP-47 locale.
    pub locale: String,
    /// IANA timezone.
    pub timezone: String,
    /// Shell preferences.
    pub shell: ShellConfig,
    /// Apps launched at boot, by content hash.
    pub boot_apps: Vec<String>,
    /// Service toggles.
    pub services: Services,
    /// Security policy.
    pub security: Security,
    /// LLM preferences.
    pub llm: LlmPrefs,
    /// Storage app-ids preserved across ephemeral boots.
    pub persist: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            mode: Mode::Ephemeral,
            name: "lumos".into(),
            locale: "en-US".into(),
            timezone: "UTC".into(),
            shell: ShellConfig::default(),
            boot_apps: Vec::new(),
            services: Services::default(),
            security: Security::default(),
            llm: LlmPrefs::default(),
            persist: Vec::new(),
        }
    }
}

/// Snapshot metadata written at solidify time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// When the snapshot was taken.
    pub created_at: chrono::DateTime<Utc>,
    /// Number of apps frozen.
    pub app_count: usize,
    /// Whether a shell document was frozen.
    pub has_shell: bool,
}

/// Profile manager bound to a data root.
pub struct ProfileManager {
    data_root: PathBuf,
    profile: RwLock<Profile>,
}

impl ProfileManager {
    /// Load `profile.yaml`, falling back to `profile.example.yaml`, then to
    /// built-in defaults. Missing sections are overlaid with defaults.
    pub async fn load(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        let mut profile = None;
        for candidate in ["profile.yaml", "profile.example.yaml"] {
            match tokio::fs::read_to_string(data_root.join(candidate)).await {
                Ok(text) => match serde_yaml::from_str::<Profile>(&text) {
                    Ok(parsed) => {
                        profile = Some(parsed);
                        break;
                    }
                    Err(e) => warn!(file = candidate, error = %e, "unparsable profile, skipping"),
                },
                Err(_) => continue,
            }
        }
        let profile = profile.unwrap_or_default();
        info!(mode = ?profile.mode, "profile loaded");
        Self { data_root, profile: RwLock::new(profile) }
    }

    /// Current profile snapshot.
    pub async fn profile(&self) -> Profile {
        self.profile.read().await.clone()
    }

    /// Current boot mode.
    pub async fn mode(&self) -> Mode {
        self.profile.read().await.mode
    }

    /// Replace the profile and write it back to disk.
    pub async fn update(&self, profile: Profile) -> Result<(), ProfileError> {
        *self.profile.write().await = profile;
        self.save().await
    }

    async fn save(&self) -> Result<(), ProfileError> {
        let serialized = serde_yaml::to_string(&*self.profile.read().await)?;
        tokio::fs::create_dir_all(&self.data_root).await?;
        tokio::fs::write(self.data_root.join("profile.yaml"), serialized).await?;
        Ok(())
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.data_root.join("snapshot")
    }

    /// Freeze `apps` and the shell under `<data_root>/snapshot/`, then flip
    /// the profile to solidified.
    pub async fn solidify(
        &self,
        apps: &[AppEntry],
        shell_html: Option<&str>,
    ) -> Result<SnapshotMeta, ProfileError> {
        let dir = self.snapshot_dir();
        tokio::fs::create_dir_all(dir.join("apps")).await?;

        for app in apps {
            let path = dir.join("apps").join(format!("{}.json", app.hash));
            tokio::fs::write(&path, serde_json::to_vec_pretty(app)?).await?;
        }
        if let Some(shell) = shell_html {
            tokio::fs::write(dir.join("shell.html"), shell).await?;
        }

        let meta = SnapshotMeta {
            created_at: Utc::now(),
            app_count: apps.len(),
            has_shell: shell_html.is_some(),
        };
        tokio::fs::write(dir.join("meta.json"), serde_json::to_vec_pretty(&meta)?).await?;

        self.profile.write().await.mode = Mode::Solidified;
        self.save().await?;
        info!(apps = apps.len(), "solidified");
        Ok(meta)
    }

    /// Flip back to ephemeral mode, optionally deleting the snapshot tree.
    pub async fn go_ephemeral(&self, clear_snapshot: bool) -> Result<(), ProfileError> {
        self.profile.write().await.mode = Mode::Ephemeral;
        self.save().await?;
        if clear_snapshot {
            match tokio::fs::remove_dir_all(self.snapshot_dir()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(cleared = clear_snapshot, "back to ephemeral mode");
        Ok(())
    }

    /// Frozen app artifact, available only in solidified mode.
    pub async fn load_snapshot_app(&self, hash: &str) -> Option<AppEntry> {
        if self.mode().await != Mode::Solidified {
            return None;
        }
        let path = self.snapshot_dir().join("apps").join(format!("{hash}.json"));
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Frozen shell document, available only in solidified mode.
    pub async fn load_snapshot_shell(&self) -> Option<String> {
        if self.mode().await != Mode::Solidified {
            return None;
        }
        tokio::fs::read_to_string(self.snapshot_dir().join("shell.html")).await.ok()
    }

    /// Snapshot metadata, if a snapshot exists.
    pub async fn snapshot_meta(&self) -> Option<SnapshotMeta> {
        let bytes = tokio::fs::read(self.snapshot_dir().join("meta.json")).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumos_types::AppType;

    fn sample_app(hash: &str) -> AppEntry {
        AppEntry {
            hash: hash.to_string(),
            prompt: "a clock".into(),
            normalized_prompt: "clock".into(),
            title: "Clock".into(),
            app_type: AppType::Iframe,
            code: "<html>clock</html>".into(),
            dockerfile: None,
            capabilities: vec![],
            model: "m".into(),
            provider: "p".into(),
            launches: 1,
            created_at: Utc::now(),
            tags: vec![],
            spec: None,
            rating: None,
        }
    }

    #[tokio::test]
    async fn missing_profile_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::load(dir.path()).await;
        let profile = manager.profile().await;
        assert_eq!(profile.mode, Mode::Ephemeral);
        assert!(profile.services.scheduler);
        assert!(profile.security.sandbox);
    }

    #[tokio::test]
    async fn partial_yaml_is_overlaid_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("profile.yaml"),
            "mode: solidified\nname: workbench\nboot_apps:\n  - abc123\n",
        )
        .unwrap();
        let manager = ProfileManager::load(dir.path()).await;
        let profile = manager.profile().await;
        assert_eq!(profile.mode, Mode::Solidified);
        assert_eq!(profile.name, "workbench");
        assert_eq!(profile.boot_apps, vec!["abc123"]);
        // Untouched sections come from defaults.
        assert_eq!(profile.shell.theme, "dark");
        assert!(profile.services.ollama);
    }

    #[tokio::test]
    async fn solidify_freezes_apps_and_flips_mode() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::load(dir.path()).await;
        let apps = vec![sample_app("abc123def4567890")];

        let meta = manager.solidify(&apps, Some("<html>shell</html>")).await.unwrap();
        assert_eq!(meta.app_count, 1);
        assert!(meta.has_shell);
        assert_eq!(manager.mode().await, Mode::Solidified);

        let frozen = manager.load_snapshot_app("abc123def4567890").await.unwrap();
        assert_eq!(frozen.code, "<html>clock</html>");
        assert_eq!(manager.load_snapshot_shell().await.unwrap(), "<html>shell</html>");

        // The mode change persisted to profile.yaml.
        let reloaded = ProfileManager::load(dir.path()).await;
        assert_eq!(reloaded.mode().await, Mode::Solidified);
    }

    #[tokio::test]
    async fn snapshot_artifacts_hidden_in_ephemeral_mode() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::load(dir.path()).await;
        manager.solidify(&[sample_app("feed")], None).await.unwrap();
        manager.go_ephemeral(false).await.unwrap();

        assert!(manager.load_snapshot_app("feed").await.is_none());
        assert!(manager.load_snapshot_shell().await.is_none());
        // The artifacts still exist on disk for a later re-solidify.
        assert!(manager.snapshot_meta().await.is_some());
    }

    #[tokio::test]
    async fn go_ephemeral_can_clear_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::load(dir.path()).await;
        manager.solidify(&[sample_app("gone")], None).await.unwrap();
        manager.go_ephemeral(true).await.unwrap();
        assert!(manager.snapshot_meta().await.is_none());
        assert!(!dir.path().join("snapshot").exists());
    }

    #[tokio::test]
    async fn profile_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::load(dir.path()).await;
        let mut profile = manager.profile().await;
        profile.name = "custom".into();
        profile.security.max_capabilities = 3;
        manager.update(profile.clone()).await.unwrap();

        let reloaded = ProfileManager::load(dir.path()).await;
        assert_eq!(reloaded.profile().await, profile);
    }
}
