//! A scriptable in-memory gateway. Doubles as the development backend for
//! machines without a managed radio, and as the test double for every
//! state-machine test.

use crate::gateway::{GatewayEvent, NetworkGateway};
use crate::types::{AccessPointRecord, ConnectionOutcome, Security};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct MockInner {
    scan_results: Vec<AccessPointRecord>,
    scan_error: Option<String>,
    scan_count: u32,
    /// Scripted per-SSID trial outcomes; unscripted SSIDs succeed when they
    /// appear in the scan results and are unreachable otherwise.
    outcomes: HashMap<String, ConnectionOutcome>,
    activate_delay: Duration,
    ap_ssid: Option<String>,
    ap_start_error: Option<String>,
    connected: Option<String>,
    subscribers: Vec<mpsc::Sender<GatewayEvent>>,
}

#[derive(Debug, Default)]
pub struct MockGateway {
    inner: Mutex<MockInner>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway pre-seeded with a plausible neighbourhood, for running the
    /// daemon without real hardware.
    pub fn with_demo_networks() -> Self {
        let gateway = Self::new();
        gateway.set_scan_results(vec![
            demo_record("MyHomeWiFi", 95, Security::WpaPersonal),
            demo_record("CafeGuest", 78, Security::Open),
            demo_record("Neighbor's Network", 55, Security::WpaPersonal),
            demo_record("CorpNet", 62, Security::WpaEnterprise),
        ]);
        gateway
    }

    // --- scripting surface ---

    pub fn set_scan_results(&self, records: Vec<AccessPointRecord>) {
        let mut inner = self.inner.lock().unwrap();
        inner.scan_results = records;
        inner.scan_error = None;
    }

    pub fn fail_scans(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().scan_error = Some(message.into());
    }

    pub fn script_outcome(&self, ssid: impl Into<String>, outcome: ConnectionOutcome) {
        self.inner.lock().unwrap().outcomes.insert(ssid.into(), outcome);
    }

    pub fn set_activate_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().activate_delay = delay;
    }

    pub fn fail_ap_start(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().ap_start_error = Some(message.into());
    }

    pub fn clear_ap_start_failure(&self) {
        self.inner.lock().unwrap().ap_start_error = None;
    }

    /// Injects a subsystem notification, mirroring its side effect on the
    /// mock's own connectivity bookkeeping.
    pub fn push_event(&self, event: GatewayEvent) {
        let subscribers = {
            let mut inner = self.inner.lock().unwrap();
            match &event {
                GatewayEvent::ConnectivityLost => inner.connected = None,
                GatewayEvent::ApStopped => inner.ap_ssid = None,
                GatewayEvent::ConnectivityAcquired { .. } => {}
            }
            inner.subscribers.clone()
        };
        for tx in subscribers {
            let _ = tx.try_send(event.clone());
        }
    }

    // --- assertions surface ---

    pub fn ap_ssid(&self) -> Option<String> {
        self.inner.lock().unwrap().ap_ssid.clone()
    }

    pub fn is_ap_started(&self) -> bool {
        self.inner.lock().unwrap().ap_ssid.is_some()
    }

    pub fn connected_ssid(&self) -> Option<String> {
        self.inner.lock().unwrap().connected.clone()
    }

    pub fn scan_count(&self) -> u32 {
        self.inner.lock().unwrap().scan_count
    }
}

#[async_trait]
impl NetworkGateway for MockGateway {
    async fn scan(&self) -> Result<Vec<AccessPointRecord>> {
        let mut inner = self.inner.lock().unwrap();
        inner.scan_count += 1;
        if let Some(message) = &inner.scan_error {
            return Err(Error::Scan(message.clone()));
        }
        let mut results = inner.scan_results.clone();
        if let Some(own) = &inner.ap_ssid {
            results.push(AccessPointRecord {
                ssid: own.clone(),
                signal: 100,
                security: Security::Open,
                bssid: "02:00:00:00:00:01".into(),
                is_portal_ap: true,
            });
        }
        Ok(results)
    }

    async fn activate(
        &self,
        ssid: &str,
        _passphrase: Option<&str>,
        timeout: Duration,
    ) -> Result<ConnectionOutcome> {
        let (delay, outcome) = {
            let inner = self.inner.lock().unwrap();
            let outcome = match inner.outcomes.get(ssid) {
                Some(scripted) => scripted.clone(),
                None if inner.scan_results.iter().any(|r| r.ssid == ssid) => {
                    ConnectionOutcome::Success { ip: Some("192.168.1.50".into()) }
                }
                None => ConnectionOutcome::NetworkUnreachable,
            };
            (inner.activate_delay, outcome)
        };

        // The real subsystem enforces the caller's deadline itself.
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Ok(ConnectionOutcome::Timeout);
        }
        tokio::time::sleep(delay).await;

        if outcome.is_success() {
            let mut inner = self.inner.lock().unwrap();
            inner.connected = Some(ssid.to_string());
        }
        Ok(outcome)
    }

    async fn start_ap(&self, ssid: &str, _passphrase: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = &inner.ap_start_error {
            return Err(Error::Ap(message.clone()));
        }
        inner.ap_ssid = Some(ssid.to_string());
        Ok(())
    }

    async fn stop_ap(&self) -> Result<()> {
        // No-op when already stopped.
        self.inner.lock().unwrap().ap_ssid = None;
        Ok(())
    }

    async fn subscribe(&self) -> mpsc::Receiver<GatewayEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().connected.is_some())
    }
}

fn demo_record(ssid: &str, signal: u8, security: Security) -> AccessPointRecord {
    AccessPointRecord {
        ssid: ssid.to_string(),
        signal,
        security,
        bssid: format!("de:mo:00:00:00:{signal:02x}"),
        is_portal_ap: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_ap_is_idempotent() {
        let gateway = MockGateway::new();
        gateway.stop_ap().await.unwrap();
        gateway.start_ap("PFC_EDU-shy-lake", None).await.unwrap();
        gateway.stop_ap().await.unwrap();
        gateway.stop_ap().await.unwrap();
        assert!(!gateway.is_ap_started());
    }

    #[tokio::test]
    async fn unscripted_visible_network_connects() {
        let gateway = MockGateway::with_demo_networks();
        let outcome = gateway
            .activate("MyHomeWiFi", Some("pass"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(gateway.connected_ssid().as_deref(), Some("MyHomeWiFi"));
    }

    #[tokio::test]
    async fn unknown_network_is_unreachable() {
        let gateway = MockGateway::with_demo_networks();
        let outcome = gateway
            .activate("NoSuchNet", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ConnectionOutcome::NetworkUnreachable);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_activation_times_out_at_deadline() {
        let gateway = MockGateway::with_demo_networks();
        gateway.set_activate_delay(Duration::from_secs(60));
        let outcome = gateway
            .activate("MyHomeWiFi", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ConnectionOutcome::Timeout);
        assert!(gateway.connected_ssid().is_none());
    }
}
