//! The provisioning state machine.
//!
//! One task owns the single [`ProvisioningState`] instance and serializes
//! every mutation: portal commands, trial results and gateway notifications
//! all arrive on the same loop. Long operations (scans, trials) run on
//! spawned tasks and report back as internal events, so the loop itself is
//! always free to answer portal queries. Read-only state flows out through
//! a watch channel.
//!
//! The reliability guarantee lives here: every failed trial rolls back to
//! AP mode, and losing an established connection re-enters AP mode, so the
//! device is never left without a reachable network path.

use crate::ap::ApManager;
use crate::config::PortalConfig;
use crate::gateway::{GatewayEvent, NetworkGateway};
use crate::trial::TrialEngine;
use crate::types::{
    AccessPointRecord, ConnectionOutcome, CredentialAttempt, Passphrase, ProvisioningState,
    StatusSnapshot, portal_listing,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What `GET /networks` serves: the portal listing plus a flag telling the
/// UI the last scan failed (radio busy or unavailable).
#[derive(Debug, Clone)]
pub struct NetworksReply {
    pub networks: Vec<AccessPointRecord>,
    pub scan_failed: bool,
}

/// Per-attempt view served by `GET /status`.
#[derive(Debug, Clone)]
pub struct AttemptStatus {
    pub state: ProvisioningState,
    pub outcome: Option<ConnectionOutcome>,
    pub reason: Option<String>,
}

enum Command {
    Networks {
        reply: oneshot::Sender<NetworksReply>,
    },
    Submit {
        ssid: String,
        passphrase: Passphrase,
        reply: oneshot::Sender<Result<u64>>,
    },
    Status {
        attempt_id: u64,
        reply: oneshot::Sender<Option<AttemptStatus>>,
    },
}

/// Results of spawned work, fed back into the loop.
enum Internal {
    ScanFinished(Result<Vec<AccessPointRecord>>),
    TrialFinished {
        attempt_id: u64,
        ssid: String,
        outcome: ConnectionOutcome,
    },
}

/// Cloneable handle the portal (and tests) talk to the machine through.
#[derive(Clone)]
pub struct MachineHandle {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<StatusSnapshot>,
}

impl MachineHandle {
    /// Current machine state, without touching the machine loop.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    /// The scan listing, refreshed first when the cache has gone stale and
    /// the machine is in a state that allows scanning. Never blocks on a
    /// pending credential trial: during one, the cached listing comes back
    /// immediately.
    pub async fn networks(&self) -> Result<NetworksReply> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Networks { reply: tx })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Submits a credential attempt. Returns the attempt id right away;
    /// the outcome is picked up later via [`MachineHandle::status`].
    pub async fn submit(&self, ssid: String, passphrase: Passphrase) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit { ssid, passphrase, reply: tx })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Status of a previously submitted attempt; `None` for unknown ids.
    pub async fn status(&self, attempt_id: u64) -> Result<Option<AttemptStatus>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { attempt_id, reply: tx })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }
}

/// Spawns the machine loop. The machine immediately attempts the
/// `Idle -> ApActive` entry; a crash or restart never resumes a prior
/// trial, it always starts over from here.
pub fn spawn(
    gateway: Arc<dyn NetworkGateway>,
    config: PortalConfig,
) -> (MachineHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::initial());
    let handle = MachineHandle { cmd_tx, status_rx };

    let task = tokio::spawn(async move {
        let events_rx = gateway.subscribe().await;
        let (internal_tx, internal_rx) = mpsc::channel(8);
        let machine = Machine {
            ap: ApManager::new(gateway.clone(), &config),
            trials: TrialEngine::new(gateway.clone()),
            gateway,
            config,
            state: ProvisioningState::Idle,
            attempts: HashMap::new(),
            next_attempt_id: 1,
            last_accepted: None,
            networks: Vec::new(),
            scanned_at: None,
            scan_failed: false,
            ap_error: None,
            pending_networks: Vec::new(),
            internal_tx,
            status_tx,
        };
        machine.run(cmd_rx, internal_rx, events_rx).await;
    });

    (handle, task)
}

struct AttemptRecord {
    ssid: String,
    outcome: Option<ConnectionOutcome>,
}

struct Machine {
    gateway: Arc<dyn NetworkGateway>,
    ap: ApManager,
    trials: TrialEngine,
    config: PortalConfig,

    state: ProvisioningState,
    attempts: HashMap<u64, AttemptRecord>,
    next_attempt_id: u64,
    last_accepted: Option<Instant>,

    networks: Vec<AccessPointRecord>,
    scanned_at: Option<Instant>,
    scan_failed: bool,
    ap_error: Option<String>,
    pending_networks: Vec<oneshot::Sender<NetworksReply>>,

    internal_tx: mpsc::Sender<Internal>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl Machine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::Receiver<Internal>,
        mut events_rx: mpsc::Receiver<GatewayEvent>,
    ) {
        self.enter_ap_mode().await;
        self.publish();

        let mut events_open = true;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // All handles gone: the service is shutting down.
                    None => break,
                },
                Some(event) = internal_rx.recv() => self.handle_internal(event).await,
                event = events_rx.recv(), if events_open => match event {
                    Some(event) => self.handle_gateway_event(event).await,
                    None => events_open = false,
                },
            }
            self.publish();
        }
        debug!("state machine loop stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Networks { reply } => {
                let fresh = self
                    .scanned_at
                    .is_some_and(|at| at.elapsed() < self.config.scan_staleness());
                match self.state {
                    // A scan is already running; join its result.
                    ProvisioningState::Scanning => self.pending_networks.push(reply),
                    ProvisioningState::ApActive | ProvisioningState::Idle if !fresh => {
                        self.state = ProvisioningState::Scanning;
                        self.pending_networks.push(reply);
                        let gateway = self.gateway.clone();
                        let tx = self.internal_tx.clone();
                        tokio::spawn(async move {
                            let result = gateway.scan().await;
                            let _ = tx.send(Internal::ScanFinished(result)).await;
                        });
                    }
                    // Fresh cache, or a trial in flight: the cache answers.
                    _ => {
                        let _ = reply.send(self.cached_networks());
                    }
                }
            }

            Command::Submit { ssid, passphrase, reply } => {
                let accepting = matches!(
                    self.state,
                    ProvisioningState::ApActive
                        | ProvisioningState::Scanning
                        | ProvisioningState::Idle
                );
                if !accepting {
                    let _ = reply.send(Err(Error::Busy));
                    return;
                }
                // Anti-hammering: one accepted submission per cooldown window.
                if self
                    .last_accepted
                    .is_some_and(|at| at.elapsed() < self.config.submit_cooldown())
                {
                    let _ = reply.send(Err(Error::Busy));
                    return;
                }

                let id = self.next_attempt_id;
                self.next_attempt_id += 1;
                self.attempts
                    .insert(id, AttemptRecord { ssid: ssid.clone(), outcome: None });
                self.last_accepted = Some(Instant::now());
                info!(attempt = id, ssid = %ssid, "credential attempt accepted");
                let _ = reply.send(Ok(id));

                // The AP comes down before the join; connecting while
                // broadcasting is not supported by single-radio devices.
                if let Err(e) = self.ap.stop().await {
                    warn!(error = %e, "failed to stop AP ahead of trial");
                }
                self.state = ProvisioningState::Trialing { attempt_id: id };

                let attempt = CredentialAttempt {
                    id,
                    ssid,
                    passphrase,
                    submitted_at: Instant::now(),
                };
                let engine = self.trials.clone();
                let timeout = self.config.trial_timeout();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let outcome = match engine.trial(&attempt, timeout).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(attempt = attempt.id, error = %e, "trial engine refused attempt");
                            ConnectionOutcome::Cancelled
                        }
                    };
                    let _ = tx
                        .send(Internal::TrialFinished {
                            attempt_id: attempt.id,
                            ssid: attempt.ssid,
                            outcome,
                        })
                        .await;
                });
            }

            Command::Status { attempt_id, reply } => {
                let status = self.attempts.get(&attempt_id).map(|record| AttemptStatus {
                    state: self.state.clone(),
                    outcome: record.outcome.clone(),
                    reason: self.reason_for(record),
                });
                let _ = reply.send(status);
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::ScanFinished(result) => {
                match result {
                    Ok(records) => {
                        debug!(count = records.len(), "scan finished");
                        self.networks = records;
                        self.scanned_at = Some(Instant::now());
                        self.scan_failed = false;
                    }
                    Err(e) => {
                        // Non-fatal: reported as an empty listing with the
                        // error flag, retried on the next networks request.
                        warn!(error = %e, "scan failed");
                        self.networks.clear();
                        self.scanned_at = None;
                        self.scan_failed = true;
                    }
                }
                if self.state == ProvisioningState::Scanning {
                    self.state = if self.ap_error.is_none() {
                        ProvisioningState::ApActive
                    } else {
                        ProvisioningState::Idle
                    };
                }
                let cached = self.cached_networks();
                for tx in self.pending_networks.drain(..) {
                    let _ = tx.send(cached.clone());
                }
            }

            Internal::TrialFinished { attempt_id, ssid, outcome } => {
                let current = matches!(
                    &self.state,
                    ProvisioningState::Trialing { attempt_id: id } if *id == attempt_id
                );
                if let Some(record) = self.attempts.get_mut(&attempt_id) {
                    record.outcome = Some(outcome.clone());
                }
                if !current {
                    warn!(attempt = attempt_id, "stale trial result ignored");
                    return;
                }
                match outcome {
                    ConnectionOutcome::Success { ip } => {
                        info!(attempt = attempt_id, ssid = %ssid, ip = ?ip, "connected to target network");
                        self.state = ProvisioningState::Connected { ssid };
                        self.ap.end_session();
                        self.ap_error = None;
                    }
                    ConnectionOutcome::AuthFailure
                    | ConnectionOutcome::Timeout
                    | ConnectionOutcome::NetworkUnreachable
                    | ConnectionOutcome::Cancelled => {
                        info!(
                            attempt = attempt_id,
                            outcome = outcome.label(),
                            "trial failed, rolling back to AP mode"
                        );
                        self.state = ProvisioningState::RollingBack;
                        self.publish();
                        // Same session: the SSID the user already knows.
                        self.enter_ap_mode().await;
                    }
                }
            }
        }
    }

    async fn handle_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::ConnectivityLost => {
                if let ProvisioningState::Connected { ssid } = &self.state {
                    warn!(ssid = %ssid, "active connection lost, falling back to AP mode");
                    // The old session ended at connect time, so this starts
                    // a fresh one with a new SSID.
                    self.enter_ap_mode().await;
                } else {
                    debug!("connectivity-lost event outside Connected, ignored");
                }
            }
            GatewayEvent::ConnectivityAcquired { ip } => {
                // The trial engine's own activate call is the authority on
                // join outcomes; this is corroboration only.
                debug!(ip = ?ip, "connectivity acquired");
            }
            GatewayEvent::ApStopped => {
                if self.state == ProvisioningState::ApActive {
                    // Neither AP nor client connection would be left: the
                    // invariant demands immediate forced re-entry.
                    warn!("AP stopped underneath us, forcing re-entry");
                    self.enter_ap_mode().await;
                }
            }
        }
    }

    /// The `-> ApActive` edge shared by startup, rollback and fallback.
    /// On failure the machine parks in `Idle` with the error surfaced; it
    /// must never report `ApActive` it does not have.
    async fn enter_ap_mode(&mut self) {
        match self.ap.start().await {
            Ok(ssid) => {
                debug!(ssid = %ssid, "entered AP mode");
                self.state = ProvisioningState::ApActive;
                self.ap_error = None;
            }
            Err(e) => {
                error!(error = %e, "failed to start access point");
                self.ap_error = Some(e.to_string());
                self.state = ProvisioningState::Idle;
            }
        }
    }

    fn cached_networks(&self) -> NetworksReply {
        NetworksReply {
            networks: portal_listing(&self.networks),
            scan_failed: self.scan_failed,
        }
    }

    fn reason_for(&self, record: &AttemptRecord) -> Option<String> {
        if let Some(e) = &self.ap_error {
            return Some(format!("access point unavailable: {e}"));
        }
        match &record.outcome {
            Some(ConnectionOutcome::AuthFailure) => {
                Some(format!("authentication rejected by \"{}\"", record.ssid))
            }
            Some(ConnectionOutcome::Timeout) => {
                Some(format!("no response from \"{}\" before the deadline", record.ssid))
            }
            Some(ConnectionOutcome::NetworkUnreachable) => {
                Some(format!("\"{}\" is unreachable", record.ssid))
            }
            Some(ConnectionOutcome::Cancelled) => Some("the attempt was cancelled".into()),
            Some(ConnectionOutcome::Success { .. }) | None => None,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(StatusSnapshot {
            state: self.state.clone(),
            ap_ssid: self.ap.session_ssid().map(str::to_string),
            networks: self.networks.clone(),
            scanned_at: self.scanned_at,
            scan_failed: self.scan_failed,
            ap_error: self.ap_error.clone(),
        });
    }
}
