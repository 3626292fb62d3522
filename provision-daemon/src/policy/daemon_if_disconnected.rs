use provision_core::config::PortalConfig;
use provision_core::frontends::UiAssetProvider;
use provision_core::gateway::NetworkGateway;
use std::sync::Arc;
use tracing::{info, warn};

/// Enters provisioning mode only when the device has no active connection;
/// an already-provisioned device boots straight into normal operation.
pub async fn run(
    gateway: Arc<dyn NetworkGateway>,
    frontend: Arc<dyn UiAssetProvider>,
    config: PortalConfig,
) -> anyhow::Result<()> {
    info!("policy: daemon-if-disconnected, checking connectivity");
    match gateway.is_connected().await {
        Ok(true) => {
            info!("already connected, provisioner will not start");
            Ok(())
        }
        Ok(false) => crate::runner::run_portal(gateway, frontend, config).await,
        Err(e) => {
            warn!(error = %e, "connectivity check failed, assuming not connected");
            crate::runner::run_portal(gateway, frontend, config).await
        }
    }
}
