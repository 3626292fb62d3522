//! One bounded attempt to join a target network. The engine owns the
//! wall-clock deadline and the single-flight guarantee; classification of
//! everything the gateway reports into a [`ConnectionOutcome`] happens
//! here, so the state machine only ever sees the closed outcome set.

use crate::gateway::NetworkGateway;
use crate::types::{ConnectionOutcome, CredentialAttempt};
use crate::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Slack on top of the gateway's own deadline. If the subsystem call is
/// still pending after `timeout + GRACE`, we stop waiting for it; a stuck
/// gateway must not hang the whole service.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct TrialEngine {
    gateway: Arc<dyn NetworkGateway>,
    in_flight: Arc<AtomicBool>,
}

impl TrialEngine {
    pub fn new(gateway: Arc<dyn NetworkGateway>) -> Self {
        Self {
            gateway,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs one trial. A second call while one is pending fails with
    /// [`Error::Busy`] instead of queueing; the in-flight attempt is not
    /// touched.
    pub async fn trial(
        &self,
        attempt: &CredentialAttempt,
        timeout: Duration,
    ) -> Result<ConnectionOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let _guard = FlightGuard(&self.in_flight);

        let passphrase = (!attempt.passphrase.is_empty()).then(|| attempt.passphrase.reveal());
        let activation = self.gateway.activate(&attempt.ssid, passphrase, timeout);

        let outcome = match tokio::time::timeout(timeout + DEADLINE_GRACE, activation).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(attempt = attempt.id, error = %e, "gateway failed during trial");
                ConnectionOutcome::NetworkUnreachable
            }
            Err(_) => {
                warn!(attempt = attempt.id, "gateway overran its deadline");
                ConnectionOutcome::Timeout
            }
        };
        Ok(outcome)
    }
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayEvent;
    use crate::gateway::mock::MockGateway;
    use crate::types::{AccessPointRecord, Passphrase};
    use async_trait::async_trait;
    use tokio::time::Instant;
    use tokio::sync::mpsc;

    fn attempt(id: u64, ssid: &str, passphrase: &str) -> CredentialAttempt {
        CredentialAttempt {
            id,
            ssid: ssid.to_string(),
            passphrase: Passphrase::new(passphrase),
            submitted_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn classifies_scripted_auth_failure() {
        let gateway = Arc::new(MockGateway::with_demo_networks());
        gateway.script_outcome("MyHomeWiFi", ConnectionOutcome::AuthFailure);
        let engine = TrialEngine::new(gateway);
        let outcome = engine
            .trial(&attempt(1, "MyHomeWiFi", "wrongpass"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ConnectionOutcome::AuthFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn second_trial_while_pending_is_busy() {
        let gateway = Arc::new(MockGateway::with_demo_networks());
        gateway.set_activate_delay(Duration::from_secs(3));
        let engine = TrialEngine::new(gateway);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .trial(&attempt(1, "MyHomeWiFi", "pass"), Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = engine
            .trial(&attempt(2, "CafeGuest", ""), Duration::from_secs(10))
            .await;
        assert!(matches!(second, Err(Error::Busy)));

        // The in-flight attempt is unaffected by the rejected one.
        let outcome = first.await.unwrap().unwrap();
        assert!(outcome.is_success());

        // And the slot frees up once the first trial resolves.
        let third = engine
            .trial(&attempt(3, "CafeGuest", ""), Duration::from_secs(10))
            .await;
        assert!(third.is_ok());
    }

    /// A gateway whose activate call never returns, to exercise the
    /// engine-side deadline.
    struct StuckGateway;

    #[async_trait]
    impl NetworkGateway for StuckGateway {
        async fn scan(&self) -> Result<Vec<AccessPointRecord>> {
            Ok(Vec::new())
        }

        async fn activate(
            &self,
            _ssid: &str,
            _passphrase: Option<&str>,
            _timeout: Duration,
        ) -> Result<ConnectionOutcome> {
            std::future::pending().await
        }

        async fn start_ap(&self, _ssid: &str, _passphrase: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn stop_ap(&self) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&self) -> mpsc::Receiver<GatewayEvent> {
            mpsc::channel(1).1
        }

        async fn is_connected(&self) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_gateway_cannot_hang_the_trial() {
        let engine = TrialEngine::new(Arc::new(StuckGateway));
        let outcome = engine
            .trial(&attempt(1, "HomeNet", "pass"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(outcome, ConnectionOutcome::Timeout);
    }
}
