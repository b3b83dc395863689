//! Kernel side of the WASM host-call channel.
//!
//! Every call re-checks the capability whitelist before touching a
//! subsystem: the sandbox gates imports at launch, and this layer holds the
//! invariant that a sandbox only ever acts within the app's granted set
//! even if a module reaches a host function some other way.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use lumos_capability::CapabilityService;
use lumos_storage::Storage;
use lumos_types::Capability;
use lumos_wasm::{HostCall, HostInterface, HostResponse};

pub struct KernelHost {
    storage: Storage,
    capabilities: Arc<CapabilityService>,
}

impl KernelHost {
    pub fn new(storage: Storage, capabilities: Arc<CapabilityService>) -> Self {
        Self { storage, capabilities }
    }

    fn require(&self, app_id: &str, cap: Capability) -> Result<(), String> {
        if self.capabilities.check(app_id, cap) {
            Ok(())
        } else {
            Err(format!("{cap} not granted"))
        }
    }
}

#[async_trait]
impl HostInterface for KernelHost {
    async fn handle(&self, app_id: &str, call: HostCall) -> HostResponse {
        match call {
            HostCall::StorageGet { key } => {
                self.require(app_id, Capability::StorageLocal)?;
                let value = self
                    .storage
                    .get(app_id, &key)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(value.unwrap_or(Value::Null))
            }
            HostCall::StorageSet { key, value } => {
                self.require(app_id, Capability::StorageLocal)?;
                // The guest hands over serialized JSON; a bare string is
                // stored as a string value.
                let parsed: Value =
                    serde_json::from_str(&value).unwrap_or(Value::String(value));
                self.storage
                    .set(app_id, &key, parsed)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(true))
            }
            HostCall::StorageRemove { key } => {
                self.require(app_id, Capability::StorageLocal)?;
                self.storage
                    .remove(app_id, &key)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(true))
            }
            HostCall::StorageKeys => {
                self.require(app_id, Capability::StorageLocal)?;
                let keys = self
                    .storage
                    .keys(app_id)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(keys))
            }
            HostCall::Notify { message } => {
                info!(app_id, %message, "app notification");
                Ok(json!(true))
            }
            HostCall::CapRequest { cap } => {
                let granted = cap
                    .parse::<Capability>()
                    .map(|cap| self.capabilities.check(app_id, cap))
                    .unwrap_or(false);
                Ok(json!(granted))
            }
        }
    }
}
