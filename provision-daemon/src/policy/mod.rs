//! Start-up policies: what the daemon does at boot, selected at compile
//! time. `policy_daemon_if_disconnected` wins when both are enabled.

#[cfg(feature = "policy_daemon_if_disconnected")]
mod daemon_if_disconnected;
#[cfg(all(feature = "policy_on_start", not(feature = "policy_daemon_if_disconnected")))]
mod on_start;

#[cfg(not(any(feature = "policy_on_start", feature = "policy_daemon_if_disconnected")))]
compile_error!(
    "No start-up policy selected. Build with policy_on_start or policy_daemon_if_disconnected."
);

use provision_core::config::PortalConfig;
use provision_core::frontends::UiAssetProvider;
use provision_core::gateway::NetworkGateway;
use std::sync::Arc;

pub async fn dispatch(
    gateway: Arc<dyn NetworkGateway>,
    frontend: Arc<dyn UiAssetProvider>,
    config: PortalConfig,
) -> anyhow::Result<()> {
    #[cfg(feature = "policy_daemon_if_disconnected")]
    return daemon_if_disconnected::run(gateway, frontend, config).await;

    #[cfg(all(feature = "policy_on_start", not(feature = "policy_daemon_if_disconnected")))]
    on_start::run(gateway, frontend, config).await
}
