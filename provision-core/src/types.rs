//! Shared data types: scan records, credential attempts, trial outcomes and
//! the provisioning state itself.

use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

/// Security classification of a scanned network, decoded from the privacy,
/// WPA, RSN and 802.1X flag bits the subsystem reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Security {
    Open,
    Wep,
    WpaPersonal,
    WpaEnterprise,
    Unknown,
}

/// One network seen during a scan. Immutable snapshot, replaced wholesale
/// on the next scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessPointRecord {
    /// Empty string means a hidden network.
    pub ssid: String,
    /// Signal strength, 0..=100, higher is stronger.
    pub signal: u8,
    pub security: Security,
    #[serde(skip)]
    pub bssid: String,
    /// True only for the device's own broadcast AP.
    #[serde(skip)]
    pub is_portal_ap: bool,
}

/// A passphrase submitted through the portal. Opaque: the `Debug`
/// representation never reveals it, so it cannot leak through logging.
#[derive(Clone)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// One portal submission. Created by the state machine, consumed exactly
/// once by the trial engine.
#[derive(Debug, Clone)]
pub struct CredentialAttempt {
    /// Monotonic counter, unique per process lifetime.
    pub id: u64,
    pub ssid: String,
    pub passphrase: Passphrase,
    pub submitted_at: Instant,
}

/// Terminal classification of one credential trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Success { ip: Option<String> },
    AuthFailure,
    Timeout,
    NetworkUnreachable,
    Cancelled,
}

impl ConnectionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectionOutcome::Success { .. })
    }

    /// Stable wire label used by the portal status endpoint.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionOutcome::Success { .. } => "success",
            ConnectionOutcome::AuthFailure => "auth_failure",
            ConnectionOutcome::Timeout => "timeout",
            ConnectionOutcome::NetworkUnreachable => "network_unreachable",
            ConnectionOutcome::Cancelled => "cancelled",
        }
    }
}

/// The single provisioning state. Owned and mutated only by the state
/// machine; everyone else reads snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    ApActive,
    Scanning,
    Trialing { attempt_id: u64 },
    Connected { ssid: String },
    RollingBack,
}

impl ProvisioningState {
    pub fn label(&self) -> &'static str {
        match self {
            ProvisioningState::Idle => "idle",
            ProvisioningState::ApActive => "ap_active",
            ProvisioningState::Scanning => "scanning",
            ProvisioningState::Trialing { .. } => "trialing",
            ProvisioningState::Connected { .. } => "connected",
            ProvisioningState::RollingBack => "rolling_back",
        }
    }
}

/// Read-only view of the machine published through a watch channel, so the
/// portal can answer status and cached-scan queries without ever blocking
/// on the machine loop.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: ProvisioningState,
    /// SSID of our own AP for the current session, if one has been started.
    pub ap_ssid: Option<String>,
    /// Last completed scan, unfiltered (portal filtering happens at read).
    pub networks: Vec<AccessPointRecord>,
    pub scanned_at: Option<Instant>,
    /// Set when the last scan attempt failed; cleared by the next good scan.
    pub scan_failed: bool,
    /// Set when the AP could not be started. The device is not reachable as
    /// a portal in this condition, and must never be reported as if it were.
    pub ap_error: Option<String>,
}

impl StatusSnapshot {
    pub fn initial() -> Self {
        Self {
            state: ProvisioningState::Idle,
            ap_ssid: None,
            networks: Vec::new(),
            scanned_at: None,
            scan_failed: false,
            ap_error: None,
        }
    }
}

/// Turns a raw scan into what the portal shows: hidden networks and our own
/// AP dropped, duplicate SSIDs collapsed to the strongest sighting, sorted
/// by descending signal.
pub fn portal_listing(records: &[AccessPointRecord]) -> Vec<AccessPointRecord> {
    let mut listing: Vec<AccessPointRecord> = Vec::new();
    for record in records {
        if record.ssid.is_empty() || record.is_portal_ap {
            continue;
        }
        match listing.iter_mut().find(|r| r.ssid == record.ssid) {
            Some(existing) => {
                if record.signal > existing.signal {
                    *existing = record.clone();
                }
            }
            None => listing.push(record.clone()),
        }
    }
    listing.sort_by(|a, b| b.signal.cmp(&a.signal));
    listing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ssid: &str, signal: u8) -> AccessPointRecord {
        AccessPointRecord {
            ssid: ssid.to_string(),
            signal,
            security: Security::WpaPersonal,
            bssid: format!("aa:bb:cc:dd:ee:{signal:02x}"),
            is_portal_ap: false,
        }
    }

    #[test]
    fn passphrase_debug_is_redacted() {
        let secret = Passphrase::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Passphrase(<redacted>)");
        assert_eq!(secret.reveal(), "hunter2");
    }

    #[test]
    fn portal_listing_drops_hidden_and_own_ap() {
        let mut own = record("PFC_EDU-shy-lake", 99);
        own.is_portal_ap = true;
        let records = vec![record("", 80), own, record("HomeNet", 70)];
        let listing = portal_listing(&records);
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].ssid, "HomeNet");
    }

    #[test]
    fn portal_listing_dedupes_keeping_strongest() {
        let records = vec![record("HomeNet", 40), record("CafeGuest", 60), record("HomeNet", 75)];
        let listing = portal_listing(&records);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].ssid, "HomeNet");
        assert_eq!(listing[0].signal, 75);
        assert_eq!(listing[1].ssid, "CafeGuest");
    }

    #[test]
    fn record_serializes_portal_fields_only() {
        let json = serde_json::to_value(record("HomeNet", 80)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ssid": "HomeNet", "signal": 80, "security": "wpa-personal"})
        );
    }
}
