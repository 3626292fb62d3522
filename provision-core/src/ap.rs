//! Lifecycle of the device's own broadcast access point: SSID generation,
//! start/stop through the gateway, and the DNS hijack that forces captive
//! portal detection while the AP is up.

use crate::config::PortalConfig;
use crate::gateway::NetworkGateway;
use crate::{Error, Result};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const ADJECTIVES: &[&str] = &[
    "shy", "bold", "calm", "brisk", "dusty", "early", "faint", "green", "humble", "keen",
    "late", "mellow", "noble", "plain", "quiet", "rustic",
];

const NOUNS: &[&str] = &[
    "lake", "cedar", "fox", "stone", "meadow", "otter", "pine", "ridge", "sparrow", "brook",
    "fern", "heron", "maple", "quail", "thicket", "wren",
];

/// Owns one AP session. The SSID is generated when a session begins and
/// held fixed for the whole session, including rollback re-entries, so a
/// user who saw the network name once keeps finding it.
pub struct ApManager {
    gateway: Arc<dyn NetworkGateway>,
    prefix: String,
    passphrase: Option<String>,
    interface: String,
    gateway_ip: String,
    captive_portal: bool,
    session_ssid: Option<String>,
    dns_hijack: Option<Child>,
}

impl ApManager {
    pub fn new(gateway: Arc<dyn NetworkGateway>, config: &PortalConfig) -> Self {
        Self {
            gateway,
            prefix: config.ssid_prefix.clone(),
            passphrase: config.ap_passphrase.clone(),
            interface: config.interface.clone(),
            gateway_ip: config.gateway_ip().to_string(),
            captive_portal: config.captive_portal,
            session_ssid: None,
            dns_hijack: None,
        }
    }

    /// SSID of the current session, if one has begun.
    pub fn session_ssid(&self) -> Option<&str> {
        self.session_ssid.as_deref()
    }

    /// Brings the AP up, starting a new session (and generating a fresh
    /// SSID) only when none is in progress. Returns the SSID in use.
    ///
    /// A failure here is fatal to the provisioning session and must reach
    /// the state machine as `Error::Ap`; retrying in a tight loop is the
    /// caller's call to *not* make.
    pub async fn start(&mut self) -> Result<String> {
        let ssid = match &self.session_ssid {
            Some(ssid) => ssid.clone(),
            None => {
                let ssid = generate_ssid(&self.prefix);
                self.session_ssid = Some(ssid.clone());
                ssid
            }
        };
        self.gateway
            .start_ap(&ssid, self.passphrase.as_deref())
            .await
            .map_err(|e| match e {
                Error::Ap(_) => e,
                other => Error::Ap(other.to_string()),
            })?;
        info!(ssid, "access point up");

        if self.captive_portal && self.dns_hijack.is_none() {
            match spawn_dns_hijack(&self.interface, &self.gateway_ip) {
                Ok(child) => self.dns_hijack = Some(child),
                // Degraded but usable: the portal stays reachable by address.
                Err(e) => warn!(error = %e, "DNS hijack unavailable, portal detection degraded"),
            }
        }
        Ok(ssid)
    }

    /// Tears the AP down. The session (and its SSID) survives, so a later
    /// `start` after a failed trial re-broadcasts the same name.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.dns_hijack.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to stop DNS hijack process");
            }
        }
        self.gateway.stop_ap().await?;
        debug!("access point down");
        Ok(())
    }

    /// Ends the session. The next `start` generates a new SSID.
    pub fn end_session(&mut self) {
        self.session_ssid = None;
    }
}

fn generate_ssid(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"aged");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"cheese");
    format!("{prefix}-{adjective}-{noun}")
}

/// Answers every DNS name with our own address while the AP is up, the
/// standard trick to trip client captive-portal probes.
fn spawn_dns_hijack(interface: &str, gateway_ip: &str) -> std::io::Result<Child> {
    Command::new("dnsmasq")
        .arg("--keep-in-foreground")
        .arg(format!("--interface={interface}"))
        .arg("--bind-interfaces")
        .arg(format!("--address=/#/{gateway_ip}"))
        .arg("--no-resolv")
        .arg("--no-hosts")
        .kill_on_drop(true)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;

    fn test_config() -> PortalConfig {
        PortalConfig {
            captive_portal: false,
            ..PortalConfig::builtin()
        }
    }

    fn parts(ssid: &str) -> (String, String, String) {
        let mut it = ssid.splitn(3, '-');
        (
            it.next().unwrap().to_string(),
            it.next().unwrap_or_default().to_string(),
            it.next().unwrap_or_default().to_string(),
        )
    }

    #[test]
    fn generated_ssid_uses_word_lists() {
        let ssid = generate_ssid("PFC_EDU");
        let (prefix, adjective, noun) = parts(&ssid);
        assert_eq!(prefix, "PFC_EDU");
        assert!(ADJECTIVES.contains(&adjective.as_str()), "{adjective}");
        assert!(NOUNS.contains(&noun.as_str()), "{noun}");
    }

    #[tokio::test]
    async fn ssid_held_fixed_across_stop_start_within_session() {
        let gateway = Arc::new(MockGateway::new());
        let mut ap = ApManager::new(gateway.clone(), &test_config());
        let first = ap.start().await.unwrap();
        ap.stop().await.unwrap();
        let second = ap.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.ap_ssid().as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn ap_start_failure_maps_to_ap_error() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_ap_start("radio busy");
        let mut ap = ApManager::new(gateway, &test_config());
        assert!(matches!(ap.start().await, Err(Error::Ap(_))));
    }

    #[tokio::test]
    async fn end_session_starts_fresh() {
        let gateway = Arc::new(MockGateway::new());
        let mut ap = ApManager::new(gateway, &test_config());
        ap.start().await.unwrap();
        assert!(ap.session_ssid().is_some());
        ap.stop().await.unwrap();
        ap.end_session();
        assert!(ap.session_ssid().is_none());
        let ssid = ap.start().await.unwrap();
        let (prefix, _, _) = parts(&ssid);
        assert_eq!(prefix, "PFC_EDU");
    }
}
