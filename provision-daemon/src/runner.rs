use anyhow::Context;
use provision_core::config::PortalConfig;
use provision_core::frontends::UiAssetProvider;
use provision_core::gateway::NetworkGateway;
use provision_core::{state, web_server};
use std::sync::Arc;
use tracing::info;

/// Spawns the state machine and the portal server, then runs until one of
/// them stops or the process is asked to shut down.
pub async fn run_portal(
    gateway: Arc<dyn NetworkGateway>,
    frontend: Arc<dyn UiAssetProvider>,
    config: PortalConfig,
) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr;
    let (machine, machine_task) = state::spawn(gateway, config);
    let server = web_server::start_web_server(machine, frontend, bind_addr);

    tokio::select! {
        result = server => result.context("portal server task")??,
        _ = machine_task => anyhow::bail!("state machine stopped unexpectedly"),
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }
    Ok(())
}
