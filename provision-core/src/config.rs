//! Portal configuration, loaded from TOML. A built-in default config is
//! compiled in from `configs/default.toml`; a file path may override it.

use crate::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortalConfig {
    /// Wireless interface the AP and station profiles bind to.
    pub interface: String,
    /// Fixed prefix of the generated AP SSID (`<prefix>-<adjective>-<noun>`).
    pub ssid_prefix: String,
    /// Passphrase for our own AP. `None` broadcasts an open AP.
    pub ap_passphrase: Option<String>,
    /// Address of the device while in AP mode, CIDR notation.
    pub ap_gateway_cidr: String,
    /// Where the portal HTTP server listens.
    pub bind_addr: SocketAddr,
    /// Hijack DNS while the AP is up so clients force-open the portal.
    pub captive_portal: bool,
    /// Wall-clock bound on a single credential trial.
    pub trial_timeout_secs: u64,
    /// How long a cached scan stays fresh before `GET /networks` rescans.
    pub scan_stale_secs: u64,
    /// Minimal delay between accepted submissions (anti-hammering).
    pub submit_cooldown_ms: u64,
}

impl PortalConfig {
    /// The compiled-in default configuration.
    pub fn builtin() -> Self {
        const DEFAULT_TOML: &str = include_str!("../../configs/default.toml");
        // The embedded default is validated by tests; a parse failure here
        // is a packaging bug, not a runtime condition.
        Self::from_toml_str(DEFAULT_TOML).expect("embedded default config must parse")
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: PortalConfig =
            toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from `path` when given, otherwise the built-in default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_toml_str(&raw)
            }
            None => Ok(Self::builtin()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ssid_prefix.is_empty() {
            return Err(Error::Config("ssid_prefix must not be empty".into()));
        }
        if self.trial_timeout_secs == 0 {
            return Err(Error::Config("trial_timeout_secs must be positive".into()));
        }
        let (ip, _prefix) = self
            .ap_gateway_cidr
            .split_once('/')
            .ok_or_else(|| Error::Config("ap_gateway_cidr must be <ip>/<prefix>".into()))?;
        ip.parse::<std::net::IpAddr>()
            .map_err(|e| Error::Config(format!("bad ap_gateway_cidr address: {e}")))?;
        Ok(())
    }

    /// The bare gateway address, without the prefix length.
    pub fn gateway_ip(&self) -> &str {
        self.ap_gateway_cidr
            .split_once('/')
            .map(|(ip, _)| ip)
            .unwrap_or(&self.ap_gateway_cidr)
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_secs(self.trial_timeout_secs)
    }

    pub fn scan_staleness(&self) -> Duration {
        Duration::from_secs(self.scan_stale_secs)
    }

    pub fn submit_cooldown(&self) -> Duration {
        Duration::from_millis(self.submit_cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_config_parses() {
        let config = PortalConfig::builtin();
        assert_eq!(config.ssid_prefix, "PFC_EDU");
        assert_eq!(config.gateway_ip(), "192.168.42.1");
        assert!(config.trial_timeout() >= Duration::from_secs(1));
    }

    #[test]
    fn rejects_malformed_gateway_cidr() {
        let raw = r#"
            interface = "wlan0"
            ssid_prefix = "PFC_EDU"
            ap_gateway_cidr = "not-an-address"
            bind_addr = "0.0.0.0:80"
            captive_portal = false
            trial_timeout_secs = 30
            scan_stale_secs = 10
            submit_cooldown_ms = 1000
        "#;
        assert!(matches!(PortalConfig::from_toml_str(raw), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = r#"
            interface = "wlan0"
            ssid_prefix = "PFC_EDU"
            ap_gateway_cidr = "192.168.42.1/24"
            bind_addr = "0.0.0.0:80"
            captive_portal = false
            trial_timeout_secs = 30
            scan_stale_secs = 10
            submit_cooldown_ms = 1000
            surprise = true
        "#;
        assert!(matches!(PortalConfig::from_toml_str(raw), Err(Error::Config(_))));
    }
}
