#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-container** – Container process manager.
//!
//! Builds and runs externally generated container images under a strict,
//! non-negotiable isolation profile (see [`constraints`]): hard memory and
//! CPU caps, dropped kernel capabilities, read-only rootfs, no network
//! namespace unless granted. Web UIs are exposed through host ports
//! allocated from a bounded range, and every container is stopped when its
//! wall-clock budget runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config as ContainerSpec, CreateContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::BuildImageOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex as PortMutex;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lumos_types::{sanitize_app_id, Capability};

pub mod constraints;
pub mod ports;

pub use constraints::{env_for, host_config_for, CONTAINER_PORT};
pub use ports::PortAllocator;

/// Delay before the health poll promotes `starting` to `running`/`failed`.
pub const STARTUP_POLL_DELAY: Duration = Duration::from_secs(3);

/// Wall-clock budget per container.
pub const WALL_CLOCK_LIMIT: Duration = Duration::from_secs(30 * 60);

/// Grace period given to a container before forced removal.
pub const STOP_GRACE_SECS: i64 = 5;

/// Container manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The container engine is not enabled or reachable.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    /// Ports or container slots exhausted.
    #[error("resource_exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// No managed process with that app id.
    #[error("not_found: {0}")]
    NotFound(String),
    /// An app with this id is already running.
    #[error("app already running: {0}")]
    Conflict(String),
    /// The image build reported an error.
    #[error("image build failed: {0}")]
    BuildFailed(String),
    /// Underlying engine API failure.
    #[error("container engine: {0}")]
    Api(#[from] bollard::errors::Error),
    /// Context archive construction failed.
    #[error("build context: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of one managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Image build in progress.
    Building,
    /// Container created and started, health not yet confirmed.
    Starting,
    /// Health poll confirmed the container is up.
    Running,
    /// Stopped by request or wall-clock budget.
    Stopped,
    /// The container exited or never became healthy.
    Failed,
}

/// Public view of one managed process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    /// App identifier.
    pub app_id: String,
    /// Engine-side container id.
    pub container_id: String,
    /// Image the container runs.
    pub image: String,
    /// Host port bound to the container's listen port.
    pub host_port: u16,
    /// Current lifecycle state.
    pub state: ProcessState,
    /// Launch time.
    pub started_at: DateTime<Utc>,
}

/// Manager configuration, environment-driven.
#[derive(Debug, Clone)]
pub struct ContainerManagerConfig {
    /// First host port in the allocation range.
    pub port_start: u16,
    /// Last host port in the allocation range.
    pub port_end: u16,
    /// Maximum simultaneously managed containers.
    pub max_containers: usize,
    /// Host directory bound into volume-granted containers.
    pub data_root: String,
    /// Anthropic key injected into `api:anthropic` containers.
    pub anthropic_key: Option<String>,
}

impl ContainerManagerConfig {
    /// Read configuration from the environment.
    pub fn from_env(data_root: &str) -> Self {
        let parse = |var: &str, default: u16| {
            std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        Self {
            port_start: parse("DOCKER_PORT_START", 5100),
            port_end: parse("DOCKER_PORT_END", 5199),
            max_containers: std::env::var("DOCKER_MAX_CONTAINERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            data_root: data_root.to_string(),
            anthropic_key: std::env::var("ANTHROPIC_API_KEY").ok(),
        }
    }
}

struct Inner {
    docker: Docker,
    config: ContainerManagerConfig,
    processes: Mutex<HashMap<String, ProcessInfo>>,
    ports: PortMutex<PortAllocator>,
}

/// The container process manager. Cheap to clone.
#[derive(Clone)]
pub struct ContainerManager {
    inner: Arc<Inner>,
}

impl ContainerManager {
    /// Connect to the local container engine. Honors `DOCKER_HOST` through
    /// the engine client's own defaults.
    pub fn new(config: ContainerManagerConfig) -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::Unavailable(e.to_string()))?;
        let ports = PortAllocator::new(config.port_start, config.port_end);
        Ok(Self {
            inner: Arc::new(Inner {
                docker,
                config,
                processes: Mutex::new(HashMap::new()),
                ports: PortMutex::new(ports),
            }),
        })
    }

    /// Build an image from a recipe plus named context files. Returns the
    /// image name.
    pub async fn build_image(
        &self,
        app_id: &str,
        recipe: &str,
        context_files: &[(String, String)],
    ) -> Result<String, ContainerError> {
        let image = format!("lumos-app-{}", sanitize_app_id(app_id).to_lowercase());
        info!(app_id, image = %image, "building container image");

        let context = build_context_tar(recipe, context_files)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream =
            self.inner
                .docker
                .build_image(options, None, Some(context.into()));
        while let Some(update) = stream.next().await {
            let update = update?;
            if let Some(message) = update.error {
                return Err(ContainerError::BuildFailed(message));
            }
            if let Some(progress) = update.stream {
                let line = progress.trim();
                if !line.is_empty() {
                    debug!(app_id, "{line}");
                }
            }
        }

        info!(app_id, image = %image, "image built");
        Ok(image)
    }

    /// Create and start a container for `app_id` under the standard
    /// constraint profile. The returned info is in `starting`; a delayed
    /// health poll promotes it to `running` or `failed`.
    pub async fn launch(
        &self,
        app_id: &str,
        image: &str,
        capabilities: &[Capability],
    ) -> Result<ProcessInfo, ContainerError> {
        {
            let processes = self.inner.processes.lock().await;
            if processes.len() >= self.inner.config.max_containers {
                return Err(ContainerError::ResourceExhausted("container slots"));
            }
            if processes.contains_key(app_id) {
                return Err(ContainerError::Conflict(app_id.to_string()));
            }
        }

        let host_port = self
            .inner
            .ports
            .lock()
            .allocate()
            .ok_or(ContainerError::ResourceExhausted("host ports"))?;

        match self.create_and_start(app_id, image, capabilities, host_port).await {
            Ok(info) => {
                self.inner
                    .processes
                    .lock()
                    .await
                    .insert(app_id.to_string(), info.clone());
                self.spawn_health_promotion(app_id.to_string());
                self.spawn_wall_clock_reaper(app_id.to_string());
                info!(app_id, port = host_port, "container launched");
                Ok(info)
            }
            Err(e) => {
                // Failed launches free the port so a retry can succeed.
                self.inner
                    .ports
                    .lock()
                    .free(host_port);
                Err(e)
            }
        }
    }

    async fn create_and_start(
        &self,
        app_id: &str,
        image: &str,
        capabilities: &[Capability],
        host_port: u16,
    ) -> Result<ProcessInfo, ContainerError> {
        let name = format!("lumos-{}", sanitize_app_id(app_id).to_lowercase());
        let host_config = host_config_for(
            capabilities,
            host_port,
            &self.inner.config.data_root,
            app_id,
        );
        let env = env_for(capabilities, self.inner.config.anthropic_key.as_deref());

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{CONTAINER_PORT}/tcp"), HashMap::new());
        let mut labels = HashMap::new();
        labels.insert("lumos.app".to_string(), app_id.to_string());

        let spec = ContainerSpec {
            image: Some(image.to_string()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .inner
            .docker
            .create_container(
                Some(CreateContainerOptions { name: name.as_str(), ..Default::default() }),
                spec,
            )
            .await?;

        self.inner
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(ProcessInfo {
            app_id: app_id.to_string(),
            container_id: created.id,
            image: image.to_string(),
            host_port,
            state: ProcessState::Starting,
            started_at: Utc::now(),
        })
    }

    fn spawn_health_promotion(&self, app_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_POLL_DELAY).await;
            let healthy = manager.health_check(&app_id).await.unwrap_or(false);
            let mut processes = manager.inner.processes.lock().await;
            if let Some(info) = processes.get_mut(&app_id) {
                if info.state == ProcessState::Starting {
                    info.state = if healthy { ProcessState::Running } else { ProcessState::Failed };
                    debug!(app_id = %app_id, state = ?info.state, "startup poll settled");
                }
            }
        });
    }

    fn spawn_wall_clock_reaper(&self, app_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(WALL_CLOCK_LIMIT).await;
            if manager.inner.processes.lock().await.contains_key(&app_id) {
                warn!(app_id = %app_id, "wall-clock budget exceeded, stopping container");
                if let Err(e) = manager.stop(&app_id).await {
                    warn!(app_id = %app_id, error = %e, "wall-clock stop failed");
                }
            }
        });
    }

    /// Stop a managed process: graceful stop, forced removal, port freed.
    /// Removal failures are logged without blocking the state update.
    pub async fn stop(&self, app_id: &str) -> Result<(), ContainerError> {
        let info = self
            .inner
            .processes
            .lock()
            .await
            .remove(app_id)
            .ok_or_else(|| ContainerError::NotFound(app_id.to_string()))?;

        if let Err(e) = self
            .inner
            .docker
            .stop_container(&info.container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            warn!(app_id, error = %e, "graceful stop failed, forcing removal");
        }
        if let Err(e) = self
            .inner
            .docker
            .remove_container(
                &info.container_id,
                Some(RemoveContainerOptions { force: true, v: true, ..Default::default() }),
            )
            .await
        {
            warn!(app_id, error = %e, "container removal failed");
        }

        self.inner
            .ports
            .lock()
            .free(info.host_port);
        info!(app_id, "container stopped");
        Ok(())
    }

    /// Whether the app's container is currently running.
    pub async fn health_check(&self, app_id: &str) -> Result<bool, ContainerError> {
        let container_id = {
            let processes = self.inner.processes.lock().await;
            processes
                .get(app_id)
                .map(|info| info.container_id.clone())
                .ok_or_else(|| ContainerError::NotFound(app_id.to_string()))?
        };
        let inspection = self.inner.docker.inspect_container(&container_id, None).await?;
        Ok(inspection
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    /// Tail of the container's log stream as clean UTF-8. The engine client
    /// strips the 8-byte multiplexing frame headers.
    pub async fn get_logs(&self, app_id: &str, tail: usize) -> Result<String, ContainerError> {
        let container_id = {
            let processes = self.inner.processes.lock().await;
            processes
                .get(app_id)
                .map(|info| info.container_id.clone())
                .ok_or_else(|| ContainerError::NotFound(app_id.to_string()))?
        };

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.inner.docker.logs(&container_id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => output.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                Err(e) => {
                    warn!(app_id, error = %e, "log stream interrupted");
                    break;
                }
            }
        }
        Ok(output)
    }

    /// Snapshot of every managed process.
    pub async fn list(&self) -> Vec<ProcessInfo> {
        self.inner.processes.lock().await.values().cloned().collect()
    }

    /// Stop every managed process, returning how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = {
            let processes = self.inner.processes.lock().await;
            processes.keys().cloned().collect()
        };
        let mut stopped = 0;
        for app_id in ids {
            match self.stop(&app_id).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(app_id = %app_id, error = %e, "stop_all entry failed"),
            }
        }
        stopped
    }

    /// Containers the engine reports under this manager's label, for
    /// reconciliation after restarts.
    pub async fn engine_containers(&self) -> Result<usize, ContainerError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec!["lumos.app".to_string()]);
        let containers = self
            .inner
            .docker
            .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
            .await?;
        Ok(containers.len())
    }
}

/// Pack the recipe and context files into an in-memory tar archive.
fn build_context_tar(
    recipe: &str,
    context_files: &[(String, String)],
) -> Result<Vec<u8>, std::io::Error> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut add = |name: &str, content: &str| -> Result<(), std::io::Error> {
        let bytes = content.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, bytes)
    };

    add("Dockerfile", recipe)?;
    for (name, content) in context_files {
        add(name, content)?;
    }
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tar_contains_all_files() {
        let tar_bytes = build_context_tar(
            "FROM alpine:3.19",
            &[("app.py".to_string(), "print('hi')".to_string())],
        )
        .unwrap();

        let mut archive = tar::Archive::new(&tar_bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["Dockerfile", "app.py"]);
    }

    #[test]
    fn image_names_are_sanitized() {
        assert_eq!(
            format!("lumos-app-{}", sanitize_app_id("My App!").to_lowercase()),
            "lumos-app-my_app_"
        );
    }
}
