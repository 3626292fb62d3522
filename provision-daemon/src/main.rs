//! Provisioning daemon: wires a gateway, the state machine and the portal
//! web server together according to the compiled-in features, then hands
//! control to the start-up policy.

mod policy;
mod runner;

use anyhow::Context;
use provision_core::config::PortalConfig;
use provision_core::frontends::{DiskFrontend, EmbedFrontend, UiAssetProvider};
use provision_core::gateway::NetworkGateway;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "gateway_networkmanager")]
fn build_gateway(config: &PortalConfig) -> Arc<dyn NetworkGateway> {
    use provision_core::gateway::networkmanager::NetworkManagerGateway;
    info!("gateway: NetworkManager (D-Bus)");
    Arc::new(NetworkManagerGateway::new(config))
}

#[cfg(all(feature = "gateway_mock", not(feature = "gateway_networkmanager")))]
fn build_gateway(_config: &PortalConfig) -> Arc<dyn NetworkGateway> {
    use provision_core::gateway::mock::MockGateway;
    info!("gateway: mock (no real radio; demo networks only)");
    Arc::new(MockGateway::with_demo_networks())
}

#[cfg(not(any(feature = "gateway_networkmanager", feature = "gateway_mock")))]
compile_error!(
    "No gateway feature selected. Build with gateway_networkmanager or gateway_mock."
);

fn build_frontend() -> Arc<dyn UiAssetProvider> {
    // PROVISION_UI_DIR serves the UI off disk for frontend development;
    // deployments use the embedded assets.
    match std::env::var("PROVISION_UI_DIR") {
        Ok(dir) => {
            info!(dir, "frontend: disk");
            Arc::new(DiskFrontend::new(dir))
        }
        Err(_) => Arc::new(EmbedFrontend::new()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = PortalConfig::load(config_path.as_deref()).context("loading configuration")?;

    let gateway = build_gateway(&config);
    let frontend = build_frontend();
    policy::dispatch(gateway, frontend, config).await
}
