use provision_core::config::PortalConfig;
use provision_core::frontends::UiAssetProvider;
use provision_core::gateway::NetworkGateway;
use std::sync::Arc;
use tracing::info;

/// Enters provisioning mode immediately at boot.
pub async fn run(
    gateway: Arc<dyn NetworkGateway>,
    frontend: Arc<dyn UiAssetProvider>,
    config: PortalConfig,
) -> anyhow::Result<()> {
    info!("policy: on-start, entering provisioning mode");
    crate::runner::run_portal(gateway, frontend, config).await
}
