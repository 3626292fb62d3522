//! Core library for the headless Wi-Fi provisioner.
//!
//! The crate is organised around one state machine ([`state`]) that owns the
//! provisioning lifecycle: broadcast our own access point, collect target
//! credentials through a captive portal ([`web_server`]), trial them against
//! the OS network subsystem ([`trial`] over a [`gateway`]), and fall back to
//! the access point whenever a trial fails so the device always stays
//! reachable.

pub mod ap;
pub mod config;
pub mod frontends;
pub mod gateway;
pub mod state;
pub mod trial;
pub mod types;
pub mod web_server;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The radio was unavailable or busy; non-fatal, retried on next scan.
    #[error("scan failed: {0}")]
    Scan(String),

    /// Starting or stopping our own access point failed. Fatal to the
    /// provisioning session.
    #[error("access point operation failed: {0}")]
    Ap(String),

    /// A credential trial is already in flight; the caller should poll
    /// status and resubmit.
    #[error("another credential trial is in flight")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "gateway_networkmanager")]
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("web server error: {0}")]
    WebServer(#[from] axum::BoxError),

    #[error("asset not found: {0}")]
    AssetNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The state machine task is gone; nothing to talk to.
    #[error("provisioning engine has shut down")]
    Shutdown,
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
