//! Synchronous host-call channel between sandboxed modules and the kernel.
//!
//! Each app has at most one in-flight call: the guest's host function runs
//! on the app's dedicated thread, sends a request to the kernel dispatch
//! loop, and blocks until the reply lands. That blocking wait is the
//! semantic twin of the busy-wait-on-ring protocol: the worker parks until
//! the kernel signals, and payloads above the cap are refused outright.

use async_trait::async_trait;
use serde_json::Value;

/// Maximum payload bytes per host call.
pub const MAX_PAYLOAD_BYTES: usize = 65_524;

/// A host call issued by a sandboxed module.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    /// Read a storage key.
    StorageGet {
        /// Key to read.
        key: String,
    },
    /// Write a storage key.
    StorageSet {
        /// Key to write.
        key: String,
        /// JSON-encoded value.
        value: String,
    },
    /// Remove a storage key.
    StorageRemove {
        /// Key to remove.
        key: String,
    },
    /// List storage keys.
    StorageKeys,
    /// Surface a notification to the shell.
    Notify {
        /// Message text.
        message: String,
    },
    /// Ask whether a capability is granted.
    CapRequest {
        /// Capability wire name.
        cap: String,
    },
}

/// Reply to a host call: a JSON value on success, an error string otherwise.
pub type HostResponse = Result<Value, String>;

/// One queued request with its reply channel. The worker thread blocks on
/// the receiving half until the kernel answers.
pub struct HostCallRequest {
    /// Issuing app.
    pub app_id: String,
    /// The call.
    pub call: HostCall,
    /// Reply slot; capacity one, a second send is a protocol violation.
    pub reply: std::sync::mpsc::SyncSender<HostResponse>,
}

/// Kernel-side handler answering host calls.
#[async_trait]
pub trait HostInterface: Send + Sync {
    /// Answer one call on behalf of `app_id`.
    async fn handle(&self, app_id: &str, call: HostCall) -> HostResponse;
}

/// A handler that rejects every call; useful for capability-less launches
/// and tests.
pub struct DenyAllHost;

#[async_trait]
impl HostInterface for DenyAllHost {
    async fn handle(&self, _app_id: &str, _call: HostCall) -> HostResponse {
        Err("host interface not wired".to_string())
    }
}
