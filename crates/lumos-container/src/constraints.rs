//! Container isolation constraints.
//!
//! Every container gets the same non-negotiable resource and isolation
//! profile at create time; only the capability-gated pieces (network,
//! volume, API key) vary per app.

use std::collections::HashMap;

use bollard::service::{HostConfig, PortBinding, ResourcesUlimits};

use lumos_types::{sanitize_app_id, Capability};

/// Memory cap: 512 MiB, swap disabled by pinning the swap limit to it.
pub const MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;

/// CPU cap: one core equivalent.
pub const NANO_CPUS: i64 = 1_000_000_000;

/// Process-count cap inside the container.
pub const PIDS_LIMIT: i64 = 64;

/// `/tmp` tmpfs size.
pub const TMPFS_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Open-file soft limit.
pub const NOFILE_SOFT: i64 = 1024;

/// Open-file hard limit.
pub const NOFILE_HARD: i64 = 2048;

/// Port generated process apps are told to listen on.
pub const CONTAINER_PORT: u16 = 8080;

/// Build the host configuration for one app launch.
///
/// `host_port` is bound to the container's fixed listen port. The data-root
/// volume appears only with `process:volume`, and the network namespace only
/// with `process:network`.
pub fn host_config_for(
    capabilities: &[Capability],
    host_port: u16,
    data_root: &str,
    app_id: &str,
) -> HostConfig {
    let network = capabilities.contains(&Capability::ProcessNetwork);
    let volume = capabilities.contains(&Capability::ProcessVolume);

    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), format!("rw,noexec,nosuid,size={TMPFS_SIZE_BYTES}"));

    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        format!("{CONTAINER_PORT}/tcp"),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(host_port.to_string()),
        }]),
    );

    let binds = volume.then(|| {
        vec![format!(
            "{}/{}:/data:rw",
            data_root.trim_end_matches('/'),
            sanitize_app_id(app_id)
        )]
    });

    HostConfig {
        memory: Some(MEMORY_LIMIT_BYTES),
        memory_swap: Some(MEMORY_LIMIT_BYTES),
        nano_cpus: Some(NANO_CPUS),
        pids_limit: Some(PIDS_LIMIT),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        tmpfs: Some(tmpfs),
        ulimits: Some(vec![ResourcesUlimits {
            name: Some("nofile".to_string()),
            soft: Some(NOFILE_SOFT),
            hard: Some(NOFILE_HARD),
        }]),
        network_mode: Some(if network { "bridge".to_string() } else { "none".to_string() }),
        port_bindings: Some(port_bindings),
        binds,
        ..Default::default()
    }
}

/// Environment for one app launch. The Anthropic key is injected only with
/// `api:anthropic`, and only when the host actually holds one.
pub fn env_for(capabilities: &[Capability], anthropic_key: Option<&str>) -> Vec<String> {
    let mut env = vec![format!("PORT={CONTAINER_PORT}")];
    if capabilities.contains(&Capability::ApiAnthropic) {
        if let Some(key) = anthropic_key {
            env.push(format!("ANTHROPIC_API_KEY={key}"));
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_constraints_are_always_applied() {
        let config = host_config_for(&[], 5100, "/data", "app");
        assert_eq!(config.memory, Some(MEMORY_LIMIT_BYTES));
        assert_eq!(config.memory_swap, Some(MEMORY_LIMIT_BYTES));
        assert_eq!(config.nano_cpus, Some(NANO_CPUS));
        assert_eq!(config.pids_limit, Some(PIDS_LIMIT));
        assert_eq!(config.readonly_rootfs, Some(true));
        assert_eq!(config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(config.security_opt, Some(vec!["no-new-privileges".to_string()]));
        let tmpfs = config.tmpfs.unwrap();
        assert!(tmpfs["/tmp"].contains("noexec"));
        assert!(tmpfs["/tmp"].contains("nosuid"));
    }

    #[test]
    fn network_is_none_without_the_capability() {
        let closed = host_config_for(&[], 5100, "/data", "app");
        assert_eq!(closed.network_mode.as_deref(), Some("none"));

        let open = host_config_for(&[Capability::ProcessNetwork], 5100, "/data", "app");
        assert_eq!(open.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn volume_bind_is_capability_gated_and_sanitized() {
        let none = host_config_for(&[], 5100, "/data", "app");
        assert!(none.binds.is_none());

        let bound = host_config_for(&[Capability::ProcessVolume], 5100, "/data", "../evil");
        let binds = bound.binds.unwrap();
        assert_eq!(binds, vec!["/data/__evil:/data:rw".to_string()]);
    }

    #[test]
    fn api_key_is_capability_gated() {
        let without = env_for(&[], Some("sk-ant-secret"));
        assert_eq!(without, vec!["PORT=8080".to_string()]);

        let with = env_for(&[Capability::ApiAnthropic], Some("sk-ant-secret"));
        assert!(with.contains(&"ANTHROPIC_API_KEY=sk-ant-secret".to_string()));

        let keyless = env_for(&[Capability::ApiAnthropic], None);
        assert_eq!(keyless, vec!["PORT=8080".to_string()]);
    }

    #[test]
    fn host_port_binds_to_loopback() {
        let config = host_config_for(&[], 5177, "/data", "app");
        let bindings = config.port_bindings.unwrap();
        let binding = bindings["8080/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("5177"));
        assert_eq!(binding[0].host_ip.as_deref(), Some("127.0.0.1"));
    }
}
