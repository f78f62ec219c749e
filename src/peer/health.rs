//! Connectivity watchdog: bounded ICE restarts, then teardown.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{NegotiationError, Result};
use crate::peer::negotiation::{NegotiationCoordinator, OfferOutcome};
use crate::peer::types::ConnectivityState;
use crate::signaling::{OutboundSignal, SignalingChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    RetryExhausted,
    TransportFailed,
    /// Disconnected before the peer identity was ever learned.
    PeerUnknown,
    PartnerLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Ignore,
    Connected,
    Restart { attempt: u32 },
    Teardown(TeardownReason),
}

#[derive(Debug)]
pub struct HealthMonitor {
    max_retries: u32,
    backoff: Duration,
    retries: u32,
}

impl HealthMonitor {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            retries: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_retries, config.restart_backoff())
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Pure decision step; bumps the retry counter for restarts.
    pub fn assess(&mut self, state: ConnectivityState, peer_known: bool) -> HealthAction {
        match state {
            ConnectivityState::Connected | ConnectivityState::Completed => {
                self.retries = 0;
                HealthAction::Connected
            }
            ConnectivityState::Disconnected if !peer_known => {
                HealthAction::Teardown(TeardownReason::PeerUnknown)
            }
            ConnectivityState::Disconnected if self.retries < self.max_retries => {
                self.retries += 1;
                HealthAction::Restart {
                    attempt: self.retries,
                }
            }
            ConnectivityState::Disconnected => HealthAction::Teardown(TeardownReason::RetryExhausted),
            ConnectivityState::Failed => HealthAction::Teardown(TeardownReason::TransportFailed),
            ConnectivityState::New | ConnectivityState::Checking | ConnectivityState::Closed => {
                HealthAction::Ignore
            }
        }
    }

    /// Reacts to a connectivity transition of the current connection.
    ///
    /// A restart sends an ICE-restart offer to `peer`. Running out of
    /// restarts is reported as [`NegotiationError::RetryExhausted`]; other
    /// teardowns come back as [`HealthAction::Teardown`] for the caller.
    pub async fn on_connectivity_change(
        &mut self,
        state: ConnectivityState,
        coordinator: &NegotiationCoordinator,
        signaling: &dyn SignalingChannel,
        peer: Option<&str>,
    ) -> Result<HealthAction> {
        let action = self.assess(state, peer.is_some());
        match action {
            HealthAction::Restart { attempt } => {
                let Some(peer) = peer else {
                    return Ok(HealthAction::Teardown(TeardownReason::PeerUnknown));
                };
                if !self.backoff.is_zero() {
                    tokio::time::sleep(self.backoff * attempt).await;
                    let recovered = coordinator
                        .current_handle()
                        .is_some_and(|h| h.connectivity_state().is_connected());
                    if recovered {
                        info!(attempt, "connection recovered during backoff");
                        return Ok(HealthAction::Ignore);
                    }
                }
                info!(attempt, max = self.max_retries, peer, "attempting ice restart");
                match coordinator.request_restart_offer().await {
                    Ok(OfferOutcome::Created(description)) => {
                        signaling
                            .send(OutboundSignal::Offer {
                                to: peer.to_owned(),
                                description,
                            })
                            .await?;
                    }
                    Ok(OfferOutcome::Skipped) => {
                        debug!(attempt, "negotiation in flight, restart offer skipped")
                    }
                    Err(err) if err.is_recoverable() => {
                        warn!(attempt, error = %err, "restart offer not possible right now")
                    }
                    Err(err) => return Err(err),
                }
            }
            HealthAction::Teardown(TeardownReason::RetryExhausted) => {
                warn!(attempts = self.retries, "ice restarts exhausted");
                return Err(NegotiationError::RetryExhausted {
                    attempts: self.retries,
                });
            }
            HealthAction::Teardown(reason) => info!(?reason, ?state, "connection lost"),
            HealthAction::Connected => debug!("connection healthy, retry counter reset"),
            HealthAction::Ignore => {}
        }
        Ok(action)
    }

    /// The relay reported that the partner left. The connection is closed
    /// right away, whatever the retry counter says, and the session's tracks
    /// are forgotten.
    pub async fn on_partner_disconnected(
        &mut self,
        coordinator: &NegotiationCoordinator,
    ) -> HealthAction {
        coordinator.reset().await;
        self.reset();
        HealthAction::Teardown(TeardownReason::PartnerLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::negotiation::OfferResponse;
    use crate::peer::types::SessionDescription;
    use crate::testing::{FakePeerFactory, RecordingSignaling};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn connected_coordinator(factory: &Arc<FakePeerFactory>) -> NegotiationCoordinator {
        let (tx, _rx) = mpsc::unbounded_channel();
        let coord =
            NegotiationCoordinator::new(factory.clone(), tx, Arc::new(AtomicU64::new(0)), true);
        let response = coord
            .receive_offer(SessionDescription::offer("remote"))
            .await
            .unwrap();
        assert!(matches!(response, OfferResponse::Answer(_)));
        coord
    }

    #[test]
    fn three_restarts_then_teardown() {
        let mut health = HealthMonitor::new(3, Duration::ZERO);
        for attempt in 1..=3 {
            assert_eq!(
                health.assess(ConnectivityState::Disconnected, true),
                HealthAction::Restart { attempt }
            );
        }
        assert_eq!(
            health.assess(ConnectivityState::Disconnected, true),
            HealthAction::Teardown(TeardownReason::RetryExhausted)
        );
    }

    #[test]
    fn connected_resets_the_counter() {
        let mut health = HealthMonitor::new(3, Duration::ZERO);
        assert_eq!(
            health.assess(ConnectivityState::Checking, true),
            HealthAction::Ignore
        );
        health.assess(ConnectivityState::Disconnected, true);
        health.assess(ConnectivityState::Disconnected, true);
        assert_eq!(health.retries(), 2);
        assert_eq!(
            health.assess(ConnectivityState::Completed, true),
            HealthAction::Connected
        );
        assert_eq!(health.retries(), 0);
    }

    #[test]
    fn no_restart_without_a_peer_or_after_failure() {
        let mut health = HealthMonitor::new(3, Duration::ZERO);
        assert_eq!(
            health.assess(ConnectivityState::Disconnected, false),
            HealthAction::Teardown(TeardownReason::PeerUnknown)
        );
        assert_eq!(
            health.assess(ConnectivityState::Failed, true),
            HealthAction::Teardown(TeardownReason::TransportFailed)
        );
        assert_eq!(health.retries(), 0);
    }

    #[tokio::test]
    async fn restart_offer_is_sent_to_the_peer() {
        let factory = Arc::new(FakePeerFactory::new());
        let coord = connected_coordinator(&factory).await;
        let signaling = RecordingSignaling::new();
        let mut health = HealthMonitor::new(3, Duration::ZERO);

        let action = health
            .on_connectivity_change(
                ConnectivityState::Disconnected,
                &coord,
                &signaling,
                Some("bob"),
            )
            .await
            .unwrap();

        assert_eq!(action, HealthAction::Restart { attempt: 1 });
        assert_eq!(factory.last().unwrap().restart_offers(), 1);
        match signaling.sent().as_slice() {
            [OutboundSignal::Offer { to, description }] => {
                assert_eq!(to, "bob");
                assert!(description.sdp.ends_with("-restart"));
            }
            other => panic!("unexpected signals {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhaustion_is_surfaced_as_an_error() {
        let factory = Arc::new(FakePeerFactory::new());
        let coord = connected_coordinator(&factory).await;
        let signaling = RecordingSignaling::new();
        let mut health = HealthMonitor::new(0, Duration::ZERO);

        let err = health
            .on_connectivity_change(
                ConnectivityState::Disconnected,
                &coord,
                &signaling,
                Some("bob"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::RetryExhausted { attempts: 0 }));
        assert!(signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn unanswered_restart_still_counts_against_the_cap() {
        let factory = Arc::new(FakePeerFactory::new());
        let coord = connected_coordinator(&factory).await;
        let signaling = RecordingSignaling::new();
        let mut health = HealthMonitor::new(2, Duration::ZERO);

        for attempt in 1..=2 {
            let action = health
                .on_connectivity_change(
                    ConnectivityState::Disconnected,
                    &coord,
                    &signaling,
                    Some("bob"),
                )
                .await
                .unwrap();
            assert_eq!(action, HealthAction::Restart { attempt });
        }
        // The second restart found the first offer still pending.
        assert_eq!(signaling.sent().len(), 1);
        assert!(health
            .on_connectivity_change(
                ConnectivityState::Disconnected,
                &coord,
                &signaling,
                Some("bob"),
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn recovery_during_backoff_skips_the_restart() {
        let factory = Arc::new(FakePeerFactory::new());
        let coord = connected_coordinator(&factory).await;
        let signaling = RecordingSignaling::new();
        let mut health = HealthMonitor::new(3, Duration::from_millis(1));
        // The transport came back before the backoff ran out.
        factory
            .last()
            .unwrap()
            .emit_connectivity(ConnectivityState::Connected);

        let action = health
            .on_connectivity_change(
                ConnectivityState::Disconnected,
                &coord,
                &signaling,
                Some("bob"),
            )
            .await
            .unwrap();
        assert_eq!(action, HealthAction::Ignore);
        assert!(signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn partner_disconnect_closes_regardless_of_counter() {
        let factory = Arc::new(FakePeerFactory::new());
        let coord = connected_coordinator(&factory).await;
        let mut health = HealthMonitor::new(3, Duration::ZERO);
        health.assess(ConnectivityState::Disconnected, true);

        let action = health.on_partner_disconnected(&coord).await;
        assert_eq!(action, HealthAction::Teardown(TeardownReason::PartnerLost));
        assert!(coord.current_handle().is_none());
        assert!(factory.last().unwrap().is_closed());
        assert_eq!(health.retries(), 0);
    }
}
