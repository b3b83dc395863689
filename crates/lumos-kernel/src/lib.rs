#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-kernel** – The trust, scheduling and isolation substrate.
//!
//! The kernel owns every component as one struct constructed in dependency
//! order (profile, scheduler state, tasks, capability key, registry) and
//! exposes the operations the HTTP collaborator calls into. Generation flows
//! through a single vetted pipeline: sanitize, score, generate, analyze,
//! publish, grant, launch.
//!
//! There are no module globals: the capability key, revocation set,
//! registry map and storage cache all live inside [`Kernel`] and are shared
//! via `Arc` where components need them.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use lumos_capability::CapabilityService;
use lumos_container::{ContainerManager, ContainerManagerConfig};
use lumos_gateway::{Gateway, GatewayConfig};
use lumos_monitor::{MonitorConfig, PromptRouter, ResourceMonitor};
use lumos_profile::ProfileManager;
use lumos_registry::Registry;
use lumos_scheduler::{Scheduler, SchedulerConfig};
use lumos_storage::{Storage, StorageConfig};
use lumos_wasm::WasmSandbox;

mod error;
mod host;
mod ops;
mod router_model;
mod tasks;

pub use error::KernelError;
pub use ops::{CreateOutcome, CreatedApp, LaunchedProcess};

/// Kernel-level configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Root of all persisted state.
    pub data_root: PathBuf,
    /// Whether the container engine should be attached.
    pub docker_enabled: bool,
    /// Whether scheduler timers run.
    pub scheduler_enabled: bool,
    /// Optional community registry endpoint.
    pub community_url: Option<String>,
    /// Interval between resource-monitor probes, in seconds.
    pub probe_interval_secs: u64,
}

impl KernelConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            data_root: std::env::var("LUMOS_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            docker_enabled: std::env::var("DOCKER_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            scheduler_enabled: std::env::var("SCHEDULER_ENABLED")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            community_url: std::env::var("LUMOS_COMMUNITY_URL").ok(),
            probe_interval_secs: 300,
        }
    }
}

/// The assembled kernel.
pub struct Kernel {
    /// Kernel configuration.
    pub config: KernelConfig,
    /// User profile and snapshots.
    pub profile: Arc<ProfileManager>,
    /// Background task scheduler.
    pub scheduler: Scheduler,
    /// Capability authority.
    pub capabilities: Arc<CapabilityService>,
    /// Per-app storage.
    pub storage: Storage,
    /// Content-addressed app registry.
    pub registry: Arc<Registry>,
    /// Resource monitor.
    pub monitor: Arc<ResourceMonitor>,
    /// Prompt router.
    pub router: PromptRouter,
    /// Generation gateway.
    pub gateway: Arc<Gateway>,
    /// WASM compute sandbox.
    pub wasm: Arc<WasmSandbox>,
    /// Container process manager, when the engine is enabled and reachable.
    pub containers: Option<ContainerManager>,
}

impl Kernel {
    /// Boot the kernel: profile, then scheduler state, task registration,
    /// capability key, and the registry. Background probes and
    /// community sync are started by [`spawn_background`].
    ///
    /// [`spawn_background`]: Kernel::spawn_background
    pub async fn boot(config: KernelConfig) -> Arc<Self> {
        let monitor = Arc::new(ResourceMonitor::new(MonitorConfig::from_env()));
        let gateway = Arc::new(
            Gateway::new(GatewayConfig::from_env(), monitor.clone(), &config.data_root).await,
        );
        Self::boot_with_gateway(config, gateway, monitor).await
    }

    /// Boot with an externally assembled gateway and monitor. Embedders
    /// (and tests) use this to supply their own provider registry.
    pub async fn boot_with_gateway(
        config: KernelConfig,
        gateway: Arc<Gateway>,
        monitor: Arc<ResourceMonitor>,
    ) -> Arc<Self> {
        let data_root = config.data_root.clone();

        let profile = Arc::new(ProfileManager::load(&data_root).await);

        let scheduler = Scheduler::open(SchedulerConfig::from_env(&data_root)).await;

        let capabilities = Arc::new(CapabilityService::new());
        capabilities.init_key();

        let storage = Storage::new(StorageConfig::new(&data_root));
        let registry = Arc::new(Registry::open(data_root.join("registry.json")).await);

        let router = PromptRouter::with_model(Arc::new(router_model::GatewayRouterModel::new(
            gateway.clone(),
        )));

        let wasm = Arc::new(WasmSandbox::new(Arc::new(host::KernelHost::new(
            storage.clone(),
            capabilities.clone(),
        ))));

        let containers = if config.docker_enabled {
            match ContainerManager::new(ContainerManagerConfig::from_env(
                &data_root.to_string_lossy(),
            )) {
                Ok(manager) => Some(manager),
                Err(e) => {
                    warn!(error = %e, "container engine unavailable, process apps disabled");
                    None
                }
            }
        } else {
            None
        };

        let kernel = Arc::new(Self {
            config,
            profile,
            scheduler,
            capabilities,
            storage,
            registry,
            monitor,
            router,
            gateway,
            wasm,
            containers,
        });

        tasks::register_builtin(&kernel);
        if kernel.config.scheduler_enabled {
            kernel.scheduler.resume_persisted_timers();
        }

        info!("kernel booted");
        kernel
    }

    /// Start the background collaborators: the periodic resource probe and
    /// an initial community sync. Call once after boot, after the HTTP
    /// listener is up.
    pub fn spawn_background(self: &Arc<Self>) {
        let kernel = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                kernel.config.probe_interval_secs,
            ));
            loop {
                ticker.tick().await;
                kernel.monitor.probe().await;
            }
        });

        if let Some(url) = self.config.community_url.clone() {
            let kernel = self.clone();
            tokio::spawn(async move {
                let imported = kernel.registry.sync_community(&url).await;
                info!(imported, "startup community sync finished");
            });
        }
    }

    /// Graceful shutdown: flush storage, persist scheduler state, stop
    /// containers.
    pub async fn shutdown(&self) {
        info!("kernel shutting down");
        if let Err(e) = self.storage.flush_all().await {
            warn!(error = %e, "storage flush on shutdown failed");
        }
        self.scheduler.persist().await;
        if let Some(containers) = &self.containers {
            let stopped = containers.stop_all().await;
            info!(stopped, "containers stopped");
        }
        self.wasm.kill_all();
    }
}
