//! Gateway-backed router model.

use std::sync::Arc;

use async_trait::async_trait;

use lumos_gateway::Gateway;
use lumos_monitor::RouterModel;
use lumos_types::ModelTask;

/// Routes classification exchanges through the gateway's provider registry,
/// using the monitor's smallest adequate routing model.
pub struct GatewayRouterModel {
    gateway: Arc<Gateway>,
}

impl GatewayRouterModel {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl RouterModel for GatewayRouterModel {
    async fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String> {
        self.gateway
            .complete_raw(system, prompt, ModelTask::Route)
            .await
            .map_err(Into::into)
    }
}
