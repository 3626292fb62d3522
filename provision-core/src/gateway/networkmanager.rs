//! NetworkManager gateway, speaking D-Bus directly.
//!
//! Scan, station activation and AP-mode profiles all go through
//! `org.freedesktop.NetworkManager`; join outcomes are classified from the
//! active connection's `StateChanged` reason codes.

use crate::config::PortalConfig;
use crate::gateway::{GatewayEvent, NetworkGateway};
use crate::types::{AccessPointRecord, ConnectionOutcome, Security};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, Proxy};

const NM_SERVICE: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_IFACE: &str = "org.freedesktop.NetworkManager";

const NM_DEVICE_TYPE_WIFI: u32 = 2;

// NM80211ApFlags / NM80211ApSecurityFlags bits we decode.
const AP_FLAGS_PRIVACY: u32 = 0x1;
const AP_SEC_KEY_MGMT_802_1X: u32 = 0x200;

// NMActiveConnectionState.
const AC_STATE_ACTIVATED: u32 = 2;
const AC_STATE_DEACTIVATED: u32 = 4;

// NMActiveConnectionStateReason values we classify.
const AC_REASON_DEVICE_DISCONNECTED: u32 = 3;
const AC_REASON_IP_CONFIG_INVALID: u32 = 5;
const AC_REASON_CONNECT_TIMEOUT: u32 = 6;
const AC_REASON_SERVICE_START_TIMEOUT: u32 = 7;
const AC_REASON_NO_SECRETS: u32 = 9;
const AC_REASON_LOGIN_FAILED: u32 = 10;

// NMState.
const NM_STATE_DISCONNECTED: u32 = 20;
const NM_STATE_CONNECTED_SITE: u32 = 60;
const NM_STATE_CONNECTED_GLOBAL: u32 = 70;

const SCAN_DONE_TIMEOUT: Duration = Duration::from_secs(15);
const STATION_PROFILE_ID: &str = "provision-sta";

pub struct NetworkManagerGateway {
    interface: String,
    ssid_prefix: String,
    gateway_cidr: String,
    // Lazy-initialized system bus connection.
    conn: Mutex<Option<Connection>>,
    // Profile and active-connection paths of our own AP, for cleanup.
    active_ap: Arc<Mutex<Option<(OwnedObjectPath, OwnedObjectPath)>>>,
    subscribers: Arc<std::sync::Mutex<Vec<mpsc::Sender<GatewayEvent>>>>,
}

impl NetworkManagerGateway {
    pub fn new(config: &PortalConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            ssid_prefix: config.ssid_prefix.clone(),
            gateway_cidr: config.ap_gateway_cidr.clone(),
            conn: Mutex::new(None),
            active_ap: Arc::new(Mutex::new(None)),
            subscribers: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    #[inline]
    fn ov<'a, V>(v: V) -> OwnedValue
    where
        V: Into<Value<'a>>,
    {
        v.into().try_into().expect("basic variant types always convert")
    }

    async fn ensure_conn(&self) -> Result<Connection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.clone() {
            return Ok(conn);
        }
        let conn = Connection::system().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn nm_proxy(&self) -> Result<Proxy<'static>> {
        let conn = self.ensure_conn().await?;
        Ok(Proxy::new(&conn, NM_SERVICE, NM_PATH, NM_IFACE).await?)
    }

    /// Picks the wireless device, preferring the configured interface.
    async fn wifi_device_path(&self) -> Result<OwnedObjectPath> {
        let conn = self.ensure_conn().await?;
        let nm = self.nm_proxy().await?;
        let msg = nm.call_method("GetDevices", &()).await?;
        let devices: Vec<OwnedObjectPath> = msg.body().deserialize()?;

        let mut fallback: Option<OwnedObjectPath> = None;
        for dpath in devices {
            let dev = Proxy::new(
                &conn,
                NM_SERVICE,
                dpath.as_ref(),
                "org.freedesktop.NetworkManager.Device",
            )
            .await?;
            let dtype: u32 = dev.get_property("DeviceType").await?;
            if dtype != NM_DEVICE_TYPE_WIFI {
                continue;
            }
            let ifname: String = dev.get_property("Interface").await?;
            if ifname == self.interface {
                return Ok(dpath);
            }
            fallback.get_or_insert(dpath);
        }
        fallback.ok_or_else(|| Error::Scan("no wireless device found".into()))
    }

    fn broadcast(&self, event: GatewayEvent) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for tx in subscribers {
            let _ = tx.try_send(event.clone());
        }
    }

    /// Watches our AP's active connection and reports an unexpected stop.
    fn watch_ap(&self, conn: Connection, ac_path: OwnedObjectPath) {
        let active_ap = self.active_ap.clone();
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            let Ok(ac) = Proxy::new(
                &conn,
                NM_SERVICE,
                ac_path.as_ref(),
                "org.freedesktop.NetworkManager.Connection.Active",
            )
            .await
            else {
                return;
            };
            let Ok(mut stream) = ac.receive_signal("StateChanged").await else {
                return;
            };
            while let Some(signal) = stream.next().await {
                let Ok((state, _reason)) = signal.body().deserialize::<(u32, u32)>() else {
                    continue;
                };
                if state == AC_STATE_DEACTIVATED {
                    // Only an unexpected stop counts; a deliberate stop_ap
                    // clears the slot before deactivating.
                    let still_ours = active_ap
                        .lock()
                        .await
                        .as_ref()
                        .is_some_and(|(_, ac)| *ac == ac_path);
                    if still_ours {
                        let subscribers = subscribers.lock().unwrap().clone();
                        for tx in subscribers {
                            let _ = tx.try_send(GatewayEvent::ApStopped);
                        }
                    }
                    return;
                }
            }
        });
    }

    /// Best-effort lease address of an activated connection.
    async fn lease_address(&self, conn: &Connection, ac_path: &OwnedObjectPath) -> Option<String> {
        let ac = Proxy::new(
            conn,
            NM_SERVICE,
            ac_path.as_ref(),
            "org.freedesktop.NetworkManager.Connection.Active",
        )
        .await
        .ok()?;
        let ip4_path: OwnedObjectPath = ac.get_property("Ip4Config").await.ok()?;
        let ip4 = Proxy::new(
            conn,
            NM_SERVICE,
            ip4_path.as_ref(),
            "org.freedesktop.NetworkManager.IP4Config",
        )
        .await
        .ok()?;
        let addresses: Vec<HashMap<String, OwnedValue>> =
            ip4.get_property("AddressData").await.ok()?;
        addresses
            .first()
            .and_then(|entry| entry.get("address"))
            .and_then(|value| String::try_from(value.clone()).ok())
    }

    /// Station profile dictionary. Open networks drop the security block
    /// entirely; NetworkManager rejects an empty one.
    fn station_settings(
        &self,
        ssid: &str,
        passphrase: Option<&str>,
    ) -> HashMap<&'static str, HashMap<&'static str, OwnedValue>> {
        let mut s_connection = HashMap::new();
        s_connection.insert("id", Self::ov(STATION_PROFILE_ID));
        s_connection.insert("type", Self::ov("802-11-wireless"));
        s_connection.insert("autoconnect", Self::ov(false));
        s_connection.insert("interface-name", Self::ov(self.interface.as_str()));

        let mut s_wifi = HashMap::new();
        s_wifi.insert("mode", Self::ov("infrastructure"));
        s_wifi.insert("ssid", Self::ov(ssid.as_bytes().to_vec()));
        // Typed SSIDs may belong to non-broadcast networks; probe actively.
        s_wifi.insert("hidden", Self::ov(true));

        let mut s_ipv4 = HashMap::new();
        s_ipv4.insert("method", Self::ov("auto"));
        let mut s_ipv6 = HashMap::new();
        s_ipv6.insert("method", Self::ov("ignore"));

        let mut settings = HashMap::new();
        settings.insert("connection", s_connection);
        settings.insert("802-11-wireless", s_wifi);
        if let Some(psk) = passphrase {
            let mut s_sec = HashMap::new();
            s_sec.insert("key-mgmt", Self::ov("wpa-psk"));
            s_sec.insert("psk", Self::ov(psk));
            settings.insert("802-11-wireless-security", s_sec);
        }
        settings.insert("ipv4", s_ipv4);
        settings.insert("ipv6", s_ipv6);
        settings
    }

    fn ap_settings(
        &self,
        ssid: &str,
        passphrase: Option<&str>,
    ) -> HashMap<&'static str, HashMap<&'static str, OwnedValue>> {
        let mut s_connection = HashMap::new();
        s_connection.insert("id", Self::ov(ssid));
        s_connection.insert("type", Self::ov("802-11-wireless"));
        s_connection.insert("autoconnect", Self::ov(false));
        s_connection.insert("interface-name", Self::ov(self.interface.as_str()));

        let mut s_wifi = HashMap::new();
        s_wifi.insert("mode", Self::ov("ap"));
        s_wifi.insert("band", Self::ov("bg"));
        s_wifi.insert("ssid", Self::ov(ssid.as_bytes().to_vec()));

        // Shared IPv4 gives clients leases and routes them to us.
        let (address, prefix) = match self.gateway_cidr.split_once('/') {
            Some((address, prefix)) => (address.to_string(), prefix.parse::<u32>().unwrap_or(24)),
            None => (self.gateway_cidr.clone(), 24),
        };
        let mut address_entry: HashMap<&str, OwnedValue> = HashMap::new();
        address_entry.insert("address", Self::ov(address));
        address_entry.insert("prefix", Self::ov(prefix));
        let mut s_ipv4 = HashMap::new();
        s_ipv4.insert("method", Self::ov("shared"));
        s_ipv4.insert("address-data", Self::ov(vec![address_entry]));

        let mut s_ipv6 = HashMap::new();
        s_ipv6.insert("method", Self::ov("ignore"));

        let mut settings = HashMap::new();
        settings.insert("connection", s_connection);
        settings.insert("802-11-wireless", s_wifi);
        if let Some(psk) = passphrase {
            let mut s_sec = HashMap::new();
            s_sec.insert("key-mgmt", Self::ov("wpa-psk"));
            s_sec.insert("psk", Self::ov(psk));
            settings.insert("802-11-wireless-security", s_sec);
        }
        settings.insert("ipv4", s_ipv4);
        settings.insert("ipv6", s_ipv6);
        settings
    }

    async fn delete_profile(&self, conn: &Connection, profile: &OwnedObjectPath) {
        let proxy = Proxy::new(
            conn,
            NM_SERVICE,
            profile.as_ref(),
            "org.freedesktop.NetworkManager.Settings.Connection",
        )
        .await;
        if let Ok(proxy) = proxy {
            if let Err(e) = proxy.call_method("Delete", &()).await {
                warn!(error = %e, "failed to delete stale connection profile");
            }
        }
    }
}

fn classify_security(flags: u32, wpa_flags: u32, rsn_flags: u32) -> Security {
    if (wpa_flags | rsn_flags) & AP_SEC_KEY_MGMT_802_1X != 0 {
        return Security::WpaEnterprise;
    }
    if wpa_flags != 0 || rsn_flags != 0 {
        return Security::WpaPersonal;
    }
    if flags & AP_FLAGS_PRIVACY != 0 {
        return Security::Wep;
    }
    Security::Open
}

fn classify_failure(reason: u32) -> ConnectionOutcome {
    match reason {
        AC_REASON_NO_SECRETS | AC_REASON_LOGIN_FAILED => ConnectionOutcome::AuthFailure,
        AC_REASON_CONNECT_TIMEOUT | AC_REASON_SERVICE_START_TIMEOUT => ConnectionOutcome::Timeout,
        AC_REASON_DEVICE_DISCONNECTED | AC_REASON_IP_CONFIG_INVALID => {
            ConnectionOutcome::NetworkUnreachable
        }
        _ => ConnectionOutcome::NetworkUnreachable,
    }
}

#[async_trait]
impl NetworkGateway for NetworkManagerGateway {
    async fn scan(&self) -> Result<Vec<AccessPointRecord>> {
        let conn = self.ensure_conn().await.map_err(|e| Error::Scan(e.to_string()))?;
        let dpath = self.wifi_device_path().await?;
        let wifi = Proxy::new(
            &conn,
            NM_SERVICE,
            dpath.as_ref(),
            "org.freedesktop.NetworkManager.Device.Wireless",
        )
        .await
        .map_err(|e| Error::Scan(e.to_string()))?;

        let mut scan_done = wifi
            .receive_signal("ScanDone")
            .await
            .map_err(|e| Error::Scan(e.to_string()))?;
        let options: HashMap<String, OwnedValue> = HashMap::new();
        wifi.call_method("RequestScan", &(options,))
            .await
            .map_err(|e| Error::Scan(format!("RequestScan failed: {e}")))?;
        if tokio::time::timeout(SCAN_DONE_TIMEOUT, scan_done.next())
            .await
            .is_err()
        {
            return Err(Error::Scan("scan timed out".into()));
        }

        let msg = wifi
            .call_method("GetAccessPoints", &())
            .await
            .map_err(|e| Error::Scan(format!("GetAccessPoints failed: {e}")))?;
        let ap_paths: Vec<OwnedObjectPath> = msg
            .body()
            .deserialize()
            .map_err(|e| Error::Scan(e.to_string()))?;

        let mut records = Vec::with_capacity(ap_paths.len());
        for ap_path in ap_paths {
            let ap = Proxy::new(
                &conn,
                NM_SERVICE,
                ap_path.as_ref(),
                "org.freedesktop.NetworkManager.AccessPoint",
            )
            .await
            .map_err(|e| Error::Scan(e.to_string()))?;

            let ssid_bytes: Vec<u8> = ap.get_property("Ssid").await.unwrap_or_default();
            let ssid = String::from_utf8(ssid_bytes).unwrap_or_default();
            let signal: u8 = ap.get_property("Strength").await.unwrap_or(0);
            let bssid: String = ap.get_property("HwAddress").await.unwrap_or_default();
            let flags: u32 = ap.get_property("Flags").await.unwrap_or(0);
            let wpa_flags: u32 = ap.get_property("WpaFlags").await.unwrap_or(0);
            let rsn_flags: u32 = ap.get_property("RsnFlags").await.unwrap_or(0);

            let is_portal_ap = ssid.starts_with(&format!("{}-", self.ssid_prefix));
            records.push(AccessPointRecord {
                ssid,
                signal,
                security: classify_security(flags, wpa_flags, rsn_flags),
                bssid,
                is_portal_ap,
            });
        }
        debug!(count = records.len(), "scan complete");
        Ok(records)
    }

    async fn activate(
        &self,
        ssid: &str,
        passphrase: Option<&str>,
        timeout: Duration,
    ) -> Result<ConnectionOutcome> {
        let conn = self.ensure_conn().await?;
        let device = self.wifi_device_path().await?;
        let nm = self.nm_proxy().await?;

        let settings = self.station_settings(ssid, passphrase);
        let specific = ObjectPath::try_from("/").expect("root path is valid");
        let reply = nm
            .call_method(
                "AddAndActivateConnection",
                &(settings, device.as_ref(), specific.as_ref()),
            )
            .await?;
        let (profile, ac_path): (OwnedObjectPath, OwnedObjectPath) = reply.body().deserialize()?;

        let ac = Proxy::new(
            &conn,
            NM_SERVICE,
            ac_path.as_ref(),
            "org.freedesktop.NetworkManager.Connection.Active",
        )
        .await?;
        let mut state_stream = ac.receive_signal("StateChanged").await?;

        let wait = async {
            while let Some(signal) = state_stream.next().await {
                let (state, reason): (u32, u32) = signal.body().deserialize()?;
                match state {
                    AC_STATE_ACTIVATED => return Ok(None),
                    AC_STATE_DEACTIVATED => return Ok(Some(reason)),
                    _ => continue,
                }
            }
            Err(Error::Dbus(zbus::Error::Failure(
                "state stream ended unexpectedly".into(),
            )))
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(None)) => {
                let ip = self.lease_address(&conn, &ac_path).await;
                debug!(ssid, ip = ?ip, "station activated");
                Ok(ConnectionOutcome::Success { ip })
            }
            Ok(Ok(Some(reason))) => {
                debug!(ssid, reason, "station activation failed");
                self.delete_profile(&conn, &profile).await;
                Ok(classify_failure(reason))
            }
            Ok(Err(e)) => {
                self.delete_profile(&conn, &profile).await;
                Err(e)
            }
            Err(_) => {
                self.delete_profile(&conn, &profile).await;
                Ok(ConnectionOutcome::Timeout)
            }
        }
    }

    async fn start_ap(&self, ssid: &str, passphrase: Option<&str>) -> Result<()> {
        // Re-issuing start on a live AP tears the old one down first; the
        // state machine relies on the end state, not on who got there.
        if self.active_ap.lock().await.is_some() {
            self.stop_ap().await?;
        }

        let conn = self.ensure_conn().await.map_err(|e| Error::Ap(e.to_string()))?;
        let device = self
            .wifi_device_path()
            .await
            .map_err(|e| Error::Ap(e.to_string()))?;
        let nm = self.nm_proxy().await.map_err(|e| Error::Ap(e.to_string()))?;

        let settings = self.ap_settings(ssid, passphrase);
        let specific = ObjectPath::try_from("/").expect("root path is valid");
        let reply = nm
            .call_method(
                "AddAndActivateConnection",
                &(settings, device.as_ref(), specific.as_ref()),
            )
            .await
            .map_err(|e| Error::Ap(format!("failed to activate AP profile: {e}")))?;
        let (profile, ac_path): (OwnedObjectPath, OwnedObjectPath) = reply
            .body()
            .deserialize()
            .map_err(|e| Error::Ap(e.to_string()))?;

        *self.active_ap.lock().await = Some((profile, ac_path.clone()));
        self.watch_ap(conn, ac_path);
        Ok(())
    }

    async fn stop_ap(&self) -> Result<()> {
        // No-op success when no AP of ours is up.
        let Some((profile, ac_path)) = self.active_ap.lock().await.take() else {
            return Ok(());
        };
        let conn = self.ensure_conn().await.map_err(|e| Error::Ap(e.to_string()))?;
        let nm = self.nm_proxy().await.map_err(|e| Error::Ap(e.to_string()))?;
        if let Err(e) = nm
            .call_method("DeactivateConnection", &(ac_path.as_ref(),))
            .await
        {
            // Already gone is fine; we delete the profile either way.
            debug!(error = %e, "AP deactivate returned an error");
        }
        self.delete_profile(&conn, &profile).await;
        Ok(())
    }

    async fn subscribe(&self) -> mpsc::Receiver<GatewayEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().unwrap().push(tx);

        // One bus watcher per subscription keeps lifetimes simple; there
        // is exactly one subscriber in practice (the state machine).
        match self.nm_proxy().await {
            Ok(nm) => match nm.receive_signal("StateChanged").await {
                Ok(mut stream) => {
                    let subscribers = self.subscribers.clone();
                    tokio::spawn(async move {
                        while let Some(signal) = stream.next().await {
                            let Ok(state) = signal.body().deserialize::<u32>() else {
                                continue;
                            };
                            let event = match state {
                                NM_STATE_CONNECTED_SITE | NM_STATE_CONNECTED_GLOBAL => {
                                    Some(GatewayEvent::ConnectivityAcquired { ip: None })
                                }
                                NM_STATE_DISCONNECTED => Some(GatewayEvent::ConnectivityLost),
                                _ => None,
                            };
                            if let Some(event) = event {
                                let txs = subscribers.lock().unwrap().clone();
                                for tx in txs {
                                    let _ = tx.try_send(event.clone());
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "cannot watch NetworkManager state"),
            },
            Err(e) => warn!(error = %e, "cannot reach NetworkManager for events"),
        }
        rx
    }

    async fn is_connected(&self) -> Result<bool> {
        let nm = self.nm_proxy().await?;
        let state: u32 = nm.get_property("State").await?;
        Ok(state == NM_STATE_CONNECTED_GLOBAL)
    }
}
