//! The boundary to the OS network subsystem.
//!
//! Everything above this module speaks [`NetworkGateway`]; the concrete
//! implementations (NetworkManager over D-Bus, or the mock used for tests
//! and local development) live below it.

pub mod mock;
#[cfg(feature = "gateway_networkmanager")]
pub mod networkmanager;

use crate::Result;
use crate::types::{AccessPointRecord, ConnectionOutcome};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Asynchronous connection-state notifications from the subsystem. These
/// are the authoritative source of connectivity truth for the state
/// machine, alongside the trial engine's own deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The device obtained an address lease on an active connection.
    ConnectivityAcquired { ip: Option<String> },
    /// The active connection was lost (carrier down, lease expired).
    ConnectivityLost,
    /// Our own AP stopped without us asking for it.
    ApStopped,
}

/// Call/event interface to the OS network subsystem.
///
/// All operations are idempotent when called on an already-satisfied state
/// (stopping a stopped AP is a no-op success); the state machine relies on
/// this to safely re-issue commands after an ambiguous outcome.
#[async_trait]
pub trait NetworkGateway: Send + Sync {
    /// One wholesale scan of visible access points.
    async fn scan(&self) -> Result<Vec<AccessPointRecord>>;

    /// Activates a station connection to `ssid`, blocking up to `timeout`.
    ///
    /// Classifiable join failures (bad credentials, no carrier, deadline
    /// expiry) are `Ok` outcomes, not errors; `Err` is reserved for the
    /// subsystem itself being unreachable.
    async fn activate(
        &self,
        ssid: &str,
        passphrase: Option<&str>,
        timeout: Duration,
    ) -> Result<ConnectionOutcome>;

    /// Brings up our own AP-mode connection. `None` passphrase is an open AP.
    async fn start_ap(&self, ssid: &str, passphrase: Option<&str>) -> Result<()>;

    /// Tears down our own AP, including its connection profile.
    async fn stop_ap(&self) -> Result<()>;

    /// Subscribes to asynchronous state-changed notifications.
    async fn subscribe(&self) -> mpsc::Receiver<GatewayEvent>;

    /// Whether the device currently holds an active connection. Used by the
    /// daemon's start-up policy, not by the state machine itself.
    async fn is_connected(&self) -> Result<bool>;
}
