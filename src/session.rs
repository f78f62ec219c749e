//! Session ownership: pairing, room control and teardown.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{NegotiationError, Result};
use crate::media::{LocalMedia, MediaSource};
use crate::peer::backend::{PeerEvent, PeerEventReceiver, PeerEventSender, PeerFactory};
use crate::peer::health::{HealthAction, HealthMonitor};
use crate::peer::negotiation::{
    AnswerOutcome, NegotiationCoordinator, OfferOutcome, OfferResponse,
};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::signaling::{InboundSignal, OutboundSignal, SignalingChannel};

/// Which side of the pairing offers first. The responder is the polite peer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_polite(self) -> bool {
        self == Role::Responder
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Waiting,
    Negotiating,
    Connected,
    PartnerLost,
    Ended,
}

/// Text relayed inside the room, for the embedding UI.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
pub enum ChatEvent {
    /// Sent by the partner.
    Message(String),
    /// System text from the relay.
    Notification(String),
}

const CHAT_CAPACITY: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub peer_identity: Option<String>,
    pub role: Role,
    pub status: SessionStatus,
}

struct RouteTarget {
    coordinator: Arc<NegotiationCoordinator>,
    peer: Option<String>,
}

/// Shortcut to the active coordinator for remote candidates, so they can be
/// buffered while the lifecycle is busy inside another handler.
#[derive(Clone, Default)]
pub struct CandidateRoute(Arc<Mutex<Option<RouteTarget>>>);

impl CandidateRoute {
    fn install(&self, coordinator: Arc<NegotiationCoordinator>, peer: Option<String>) {
        *self.0.lock() = Some(RouteTarget { coordinator, peer });
    }

    fn set_peer(&self, peer: &str) {
        if let Some(target) = self.0.lock().as_mut() {
            target.peer = Some(peer.to_owned());
        }
    }

    fn clear(&self) {
        *self.0.lock() = None;
    }

    /// The active coordinator, if `from` is the session's peer.
    pub fn coordinator_for(&self, from: &str) -> Option<Arc<NegotiationCoordinator>> {
        self.0
            .lock()
            .as_ref()
            .filter(|target| target.peer.as_deref() == Some(from))
            .map(|target| target.coordinator.clone())
    }

    /// Buffers a candidate from the session peer without touching the
    /// lifecycle. The candidate comes back if it cannot be buffered yet.
    pub fn buffer(&self, from: &str, candidate: IceCandidate) -> Result<(), IceCandidate> {
        match self.coordinator_for(from) {
            Some(coordinator) => coordinator.buffer_candidate(candidate).map(|_| ()),
            None => Err(candidate),
        }
    }

    /// Applies candidates buffered while a handler was running.
    pub async fn flush(&self) -> usize {
        let coordinator = self.0.lock().as_ref().map(|t| t.coordinator.clone());
        match coordinator {
            Some(coordinator) => coordinator.flush_candidates().await,
            None => 0,
        }
    }
}

struct ActiveSession {
    session: Session,
    coordinator: Arc<NegotiationCoordinator>,
    health: HealthMonitor,
    /// Candidates that arrived before the responder learned its peer.
    early_candidates: Vec<(String, IceCandidate)>,
}

impl ActiveSession {
    fn is_open(&self) -> bool {
        self.session.status != SessionStatus::PartnerLost
    }
}

pub struct SessionLifecycle {
    config: EngineConfig,
    factory: Arc<dyn PeerFactory>,
    media_source: Arc<dyn MediaSource>,
    signaling: Arc<dyn SignalingChannel>,
    events: PeerEventSender,
    generations: Arc<AtomicU64>,
    status_tx: watch::Sender<SessionStatus>,
    chat: broadcast::Sender<ChatEvent>,
    active: Option<ActiveSession>,
    local_media: Option<LocalMedia>,
    route: CandidateRoute,
}

impl SessionLifecycle {
    /// The returned receiver carries callbacks from every connection this
    /// lifecycle creates; feed them back through [`Self::handle_peer_event`].
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn PeerFactory>,
        media_source: Arc<dyn MediaSource>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> (Self, PeerEventReceiver) {
        let (events, peer_events) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        let (chat, _) = broadcast::channel(CHAT_CAPACITY);
        let lifecycle = Self {
            config,
            factory,
            media_source,
            signaling,
            events,
            generations: Arc::new(AtomicU64::new(0)),
            status_tx,
            chat,
            active: None,
            local_media: None,
            route: CandidateRoute::default(),
        };
        (lifecycle, peer_events)
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatEvent> {
        self.chat.subscribe()
    }

    pub(crate) fn chat_sender(&self) -> broadcast::Sender<ChatEvent> {
        self.chat.clone()
    }

    pub fn coordinator(&self) -> Option<Arc<NegotiationCoordinator>> {
        self.active.as_ref().map(|a| a.coordinator.clone())
    }

    pub fn retries(&self) -> u32 {
        self.active.as_ref().map_or(0, |a| a.health.retries())
    }

    pub fn route(&self) -> CandidateRoute {
        self.route.clone()
    }

    fn set_status(&mut self, status: SessionStatus) {
        if let Some(active) = self.active.as_mut() {
            active.session.status = status;
        }
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info!(from = ?previous, to = ?status, "session status changed");
        }
    }

    fn release_media(&mut self) {
        if let Some(media) = self.local_media.take() {
            self.media_source.release(&media);
        }
    }

    /// The session peer if `from` is it. Identity is adopted from an offer
    /// when the pairing event did not carry one. Nothing passes once the
    /// partner is gone.
    fn check_peer(&mut self, from: &str, adopt: bool) -> Option<Arc<NegotiationCoordinator>> {
        let active = self.active.as_mut()?;
        if !active.is_open() {
            debug!(from, "partner already gone, message dropped");
            return None;
        }
        let known = active.session.peer_identity.clone();
        match known.as_deref() {
            Some(peer) if peer == from => {}
            None if adopt => {
                info!(peer = from, "peer identity learned from offer");
                active.session.peer_identity = Some(from.to_owned());
                self.route.set_peer(from);
            }
            _ => {
                warn!(from, expected = ?known, "message from unexpected peer ignored");
                return None;
            }
        }
        Some(active.coordinator.clone())
    }

    pub async fn handle_signal(&mut self, signal: InboundSignal) -> Result<()> {
        trace!(kind = signal.kind(), "signal");
        match signal {
            InboundSignal::Paired {
                session_id,
                peer_identity,
                role,
            } => self.on_paired(session_id, peer_identity, role).await,
            InboundSignal::Offer {
                peer_identity,
                description,
            } => self.on_offer(peer_identity, description).await,
            InboundSignal::Answer {
                peer_identity,
                description,
            } => self.on_answer(&peer_identity, description).await,
            InboundSignal::Candidate {
                peer_identity,
                candidate,
            } => self.on_candidate(&peer_identity, candidate).await,
            InboundSignal::PartnerDisconnected => self.on_partner_disconnected().await,
            InboundSignal::ChatMessage { message } => {
                self.on_chat(message);
                Ok(())
            }
            InboundSignal::Notification { message } => {
                self.publish_chat(ChatEvent::Notification(message));
                Ok(())
            }
        }
    }

    async fn on_paired(
        &mut self,
        session_id: String,
        peer_identity: Option<String>,
        role: Role,
    ) -> Result<()> {
        if self.active.is_some() {
            info!("new pairing replaces the active session");
            self.reset().await;
        }

        let media = match self.media_source.acquire().await {
            Ok(media) => media,
            Err(err) => {
                warn!(session_id, error = %err, "local media unavailable, ending session");
                self.signaling
                    .send(OutboundSignal::EndSession { session_id })
                    .await?;
                self.set_status(SessionStatus::Ended);
                return Err(err);
            }
        };

        let coordinator = Arc::new(NegotiationCoordinator::new(
            self.factory.clone(),
            self.events.clone(),
            self.generations.clone(),
            role.is_polite(),
        ));
        // Tracks go onto every connection before its first offer.
        coordinator.attach_tracks(&media).await?;
        self.local_media = Some(media);

        info!(session_id, peer = ?peer_identity, ?role, "paired");
        self.route
            .install(coordinator.clone(), peer_identity.clone());
        self.active = Some(ActiveSession {
            session: Session {
                session_id,
                peer_identity,
                role,
                status: SessionStatus::Negotiating,
            },
            coordinator,
            health: HealthMonitor::from_config(&self.config),
            early_candidates: Vec::new(),
        });
        self.set_status(SessionStatus::Negotiating);

        if role == Role::Initiator {
            self.request_offer().await?;
        }
        Ok(())
    }

    /// Creates and sends an offer. A superseded connection is retried once on
    /// its replacement; a signaling state that forbids offering is reported
    /// as [`OfferOutcome::Skipped`].
    pub async fn request_offer(&mut self) -> Result<OfferOutcome> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.is_open())
            .ok_or(NegotiationError::NoActiveSession)?;
        let Some(peer) = active.session.peer_identity.clone() else {
            warn!("peer identity unknown, cannot address an offer");
            return Ok(OfferOutcome::Skipped);
        };
        let coordinator = active.coordinator.clone();

        let outcome = match coordinator.request_offer().await {
            Err(NegotiationError::StaleHandle { generation }) => {
                debug!(generation, "offer hit a replaced connection, retrying");
                coordinator.request_offer().await
            }
            other => other,
        };
        match outcome {
            Ok(OfferOutcome::Created(description)) => {
                self.signaling
                    .send(OutboundSignal::Offer {
                        to: peer,
                        description: description.clone(),
                    })
                    .await?;
                Ok(OfferOutcome::Created(description))
            }
            Ok(OfferOutcome::Skipped) => Ok(OfferOutcome::Skipped),
            Err(NegotiationError::InvalidState { operation, state }) => {
                debug!(operation, ?state, "offer not possible in this state");
                Ok(OfferOutcome::Skipped)
            }
            Err(err) => Err(err),
        }
    }

    async fn on_offer(&mut self, from: String, description: SessionDescription) -> Result<()> {
        let Some(coordinator) = self.check_peer(&from, true) else {
            return Ok(());
        };
        for candidate in self.take_early_candidates(&from) {
            coordinator.receive_candidate(candidate).await?;
        }
        let response = match coordinator.receive_offer(description.clone()).await {
            Err(NegotiationError::StaleHandle { generation }) => {
                debug!(generation, "offer hit a replaced connection, retrying");
                coordinator.receive_offer(description).await
            }
            other => other,
        };
        match response {
            Ok(OfferResponse::Answer(description)) => {
                self.signaling
                    .send(OutboundSignal::Answer {
                        to: from,
                        description,
                    })
                    .await
            }
            Ok(OfferResponse::Ignored) => Ok(()),
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "remote offer discarded");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn on_answer(&mut self, from: &str, description: SessionDescription) -> Result<()> {
        let Some(coordinator) = self.check_peer(from, false) else {
            return Ok(());
        };
        match coordinator.receive_answer(description).await {
            Ok(AnswerOutcome::Completed) => {
                coordinator.sync_tracks().await?;
                Ok(())
            }
            Ok(AnswerOutcome::Discarded) => Ok(()),
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "remote answer discarded");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn on_candidate(&mut self, from: &str, candidate: IceCandidate) -> Result<()> {
        if let Some(active) = self.active.as_mut() {
            if active.is_open() && active.session.peer_identity.is_none() {
                debug!(from, "candidate before the peer is known, held");
                active.early_candidates.push((from.to_owned(), candidate));
                return Ok(());
            }
        }
        let Some(coordinator) = self.check_peer(from, false) else {
            return Ok(());
        };
        match coordinator.receive_candidate(candidate).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_recoverable() => {
                debug!(error = %err, "remote candidate dropped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Held candidates sent by `from`, in arrival order. The rest came from
    /// someone who is not the session peer and are dropped.
    fn take_early_candidates(&mut self, from: &str) -> Vec<IceCandidate> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let held = std::mem::take(&mut active.early_candidates);
        let total = held.len();
        let kept: Vec<IceCandidate> = held
            .into_iter()
            .filter(|(sender, _)| sender == from)
            .map(|(_, candidate)| candidate)
            .collect();
        if kept.len() < total {
            debug!(dropped = total - kept.len(), "held candidates from another peer dropped");
        }
        kept
    }

    fn publish_chat(&self, event: ChatEvent) {
        if self.chat.send(event).is_err() {
            trace!("no chat subscribers");
        }
    }

    fn on_chat(&self, message: String) {
        match self.active.as_ref() {
            Some(active) if active.is_open() => self.publish_chat(ChatEvent::Message(message)),
            _ => debug!("chat message outside a session dropped"),
        }
    }

    /// Sends a chat line to the partner. Blank lines are not sent.
    pub async fn send_chat(&mut self, message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Ok(());
        }
        let session_id = self
            .active
            .as_ref()
            .filter(|a| a.is_open())
            .map(|a| a.session.session_id.clone())
            .ok_or(NegotiationError::NoActiveSession)?;
        self.signaling
            .send(OutboundSignal::ChatMessage {
                session_id,
                message: message.to_owned(),
            })
            .await
    }

    async fn on_partner_disconnected(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            debug!("partner disconnect without a session");
            return Ok(());
        };
        active.early_candidates.clear();
        let action = active
            .health
            .on_partner_disconnected(&active.coordinator)
            .await;
        debug!(?action, "partner disconnected");
        self.route.clear();
        self.release_media();
        self.set_status(SessionStatus::PartnerLost);
        Ok(())
    }

    /// Routes a callback from the peer connection. Events from a replaced
    /// connection generation are ignored.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            trace!(?event, "peer event without a session");
            return Ok(());
        };
        let generation = event.generation();
        if active.coordinator.current_generation() != Some(generation) {
            debug!(generation, "event from a replaced connection ignored");
            return Ok(());
        }

        match event {
            PeerEvent::LocalCandidate { candidate, .. } => {
                let Some(peer) = active.session.peer_identity.clone() else {
                    debug!("local candidate before the peer is known, dropped");
                    return Ok(());
                };
                self.signaling
                    .send(OutboundSignal::Candidate {
                        to: peer,
                        candidate,
                    })
                    .await
            }
            PeerEvent::Connectivity { state, .. } => {
                let peer = active.session.peer_identity.clone();
                let assessed = active
                    .health
                    .on_connectivity_change(
                        state,
                        &active.coordinator,
                        self.signaling.as_ref(),
                        peer.as_deref(),
                    )
                    .await;
                let coordinator = active.coordinator.clone();

                match assessed {
                    Ok(HealthAction::Connected) => {
                        coordinator.sync_tracks().await?;
                        self.set_status(SessionStatus::Connected);
                        Ok(())
                    }
                    Ok(HealthAction::Teardown(reason)) => {
                        info!(?reason, "tearing down session");
                        self.end_and_repair().await
                    }
                    Ok(HealthAction::Restart { .. } | HealthAction::Ignore) => Ok(()),
                    Err(err @ NegotiationError::RetryExhausted { .. }) => {
                        self.end_and_repair().await?;
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
            PeerEvent::RemoteTrack { track_id, kind, .. } => {
                info!(track_id, ?kind, "remote track received");
                Ok(())
            }
            PeerEvent::NegotiationNeeded { .. } => {
                if active.session.status == SessionStatus::Connected {
                    debug!(generation, "renegotiation requested by the connection");
                    self.request_offer().await?;
                }
                Ok(())
            }
        }
    }

    /// User accepted another pairing: drop whatever is left and queue up.
    pub async fn accept_pairing(&mut self) -> Result<()> {
        if self.active.is_some() {
            self.reset().await;
        }
        self.signaling.send(OutboundSignal::JoinQueue).await?;
        self.set_status(SessionStatus::Waiting);
        Ok(())
    }

    pub async fn skip(&mut self) -> Result<()> {
        info!("skipping partner");
        self.end_and_repair().await
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(session_id) = self.active.as_ref().map(|a| a.session.session_id.clone()) {
            self.signaling
                .send(OutboundSignal::EndSession { session_id })
                .await?;
        }
        self.reset().await;
        self.set_status(SessionStatus::Ended);
        Ok(())
    }

    /// Ends the current session (if any) and asks the relay for a new partner.
    pub async fn end_and_repair(&mut self) -> Result<()> {
        if let Some(session_id) = self.active.as_ref().map(|a| a.session.session_id.clone()) {
            self.signaling
                .send(OutboundSignal::EndSession { session_id })
                .await?;
        }
        self.reset().await;
        self.signaling.send(OutboundSignal::JoinQueue).await?;
        self.set_status(SessionStatus::Waiting);
        Ok(())
    }

    /// Closes the connection, drops buffered candidates, zeroes the retry
    /// counter and the negotiating flag, then releases local media.
    pub async fn reset(&mut self) {
        self.route.clear();
        if let Some(active) = self.active.take() {
            active.coordinator.reset().await;
            debug!(session_id = %active.session.session_id, "session reset");
        }
        self.release_media();
        self.set_status(SessionStatus::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::ConnectivityState;
    use crate::testing::{FakeMediaSource, FakePeerFactory, RecordingSignaling};

    struct Harness {
        lifecycle: SessionLifecycle,
        _events: PeerEventReceiver,
        factory: Arc<FakePeerFactory>,
        media: Arc<FakeMediaSource>,
        signaling: Arc<RecordingSignaling>,
    }

    fn harness(media: FakeMediaSource) -> Harness {
        let factory = Arc::new(FakePeerFactory::new());
        let media = Arc::new(media);
        let signaling = Arc::new(RecordingSignaling::new());
        let (lifecycle, events) = SessionLifecycle::new(
            EngineConfig::default(),
            factory.clone(),
            media.clone(),
            signaling.clone(),
        );
        Harness {
            lifecycle,
            _events: events,
            factory,
            media,
            signaling,
        }
    }

    fn paired(role: Role, peer: Option<&str>) -> InboundSignal {
        InboundSignal::Paired {
            session_id: "room-1".into(),
            peer_identity: peer.map(str::to_owned),
            role,
        }
    }

    #[tokio::test]
    async fn initiator_offers_with_tracks_attached() {
        let mut h = harness(FakeMediaSource::new());
        h.lifecycle
            .handle_signal(paired(Role::Initiator, Some("bob")))
            .await
            .unwrap();

        assert_eq!(h.lifecycle.status(), SessionStatus::Negotiating);
        let peer = h.factory.last().unwrap();
        assert_eq!(peer.tracks_at_offer(), vec![2]);
        assert!(matches!(
            h.signaling.sent().as_slice(),
            [OutboundSignal::Offer { to, .. }] if to == "bob"
        ));
    }

    #[tokio::test]
    async fn media_failure_ends_the_session() {
        let mut h = harness(FakeMediaSource::failing());
        let err = h
            .lifecycle
            .handle_signal(paired(Role::Initiator, Some("bob")))
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiationError::MediaAcquisitionFailed(_)));
        assert_eq!(h.lifecycle.status(), SessionStatus::Ended);
        assert_eq!(h.factory.created(), 0);
        assert_eq!(
            h.signaling.sent(),
            vec![OutboundSignal::EndSession {
                session_id: "room-1".into()
            }]
        );
    }

    #[tokio::test]
    async fn responder_learns_peer_from_first_offer() {
        let mut h = harness(FakeMediaSource::new());
        h.lifecycle
            .handle_signal(paired(Role::Responder, None))
            .await
            .unwrap();
        assert!(h.signaling.sent().is_empty());

        h.lifecycle
            .handle_signal(InboundSignal::Offer {
                peer_identity: "alice".into(),
                description: SessionDescription::offer("o"),
            })
            .await
            .unwrap();
        assert_eq!(
            h.lifecycle.session().unwrap().peer_identity.as_deref(),
            Some("alice")
        );
        assert!(matches!(
            h.signaling.sent().as_slice(),
            [OutboundSignal::Answer { to, .. }] if to == "alice"
        ));

        // A second identity is not the session's peer.
        h.lifecycle
            .handle_signal(InboundSignal::Offer {
                peer_identity: "mallory".into(),
                description: SessionDescription::offer("o2"),
            })
            .await
            .unwrap();
        assert_eq!(h.signaling.sent().len(), 1);
        assert!(h.lifecycle.route().coordinator_for("mallory").is_none());
        assert!(h.lifecycle.route().coordinator_for("alice").is_some());
    }

    #[tokio::test]
    async fn candidates_ahead_of_the_first_offer_are_held_for_that_peer() {
        let mut h = harness(FakeMediaSource::new());
        h.lifecycle
            .handle_signal(paired(Role::Responder, None))
            .await
            .unwrap();
        let cand =
            |n: u32| IceCandidate::new(format!("candidate:{n} 1 udp 1 10.9.0.{n} 7000 typ host"));
        for (from, n) in [("alice", 1), ("mallory", 2), ("alice", 3)] {
            h.lifecycle
                .handle_signal(InboundSignal::Candidate {
                    peer_identity: from.into(),
                    candidate: cand(n),
                })
                .await
                .unwrap();
        }
        assert_eq!(h.factory.created(), 0);

        h.lifecycle
            .handle_signal(InboundSignal::Offer {
                peer_identity: "alice".into(),
                description: SessionDescription::offer("o"),
            })
            .await
            .unwrap();
        let peer = h.factory.last().unwrap();
        assert_eq!(peer.applied_candidates(), vec![cand(1), cand(3)]);
        assert_eq!(peer.answers(), 1);
    }

    #[tokio::test]
    async fn failed_reacquisition_ends_the_next_session() {
        let mut h = harness(FakeMediaSource::new());
        h.lifecycle
            .handle_signal(paired(Role::Responder, Some("alice")))
            .await
            .unwrap();
        assert_eq!(h.media.acquisitions(), 1);

        h.media.set_failing(true);
        let err = h
            .lifecycle
            .handle_signal(paired(Role::Initiator, Some("bob")))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::MediaAcquisitionFailed(_)));
        assert_eq!(h.media.acquisitions(), 1);
        assert_eq!(h.media.releases(), 1);
        assert_eq!(h.lifecycle.status(), SessionStatus::Ended);
        assert!(h.factory.peers().iter().all(|peer| peer.is_closed()));
    }

    #[tokio::test]
    async fn stale_generation_events_are_ignored() {
        let mut h = harness(FakeMediaSource::new());
        h.lifecycle
            .handle_signal(paired(Role::Initiator, Some("bob")))
            .await
            .unwrap();
        let old = h.factory.last().unwrap();
        h.lifecycle
            .coordinator()
            .unwrap()
            .replace_handle()
            .await
            .unwrap();

        h.lifecycle
            .handle_peer_event(PeerEvent::Connectivity {
                generation: old.generation(),
                state: ConnectivityState::Failed,
            })
            .await
            .unwrap();
        assert_eq!(h.lifecycle.status(), SessionStatus::Negotiating);
    }

    #[tokio::test]
    async fn stop_releases_media_and_ends() {
        let mut h = harness(FakeMediaSource::new());
        h.lifecycle
            .handle_signal(paired(Role::Responder, Some("alice")))
            .await
            .unwrap();
        h.lifecycle.stop().await.unwrap();

        assert_eq!(h.lifecycle.status(), SessionStatus::Ended);
        assert!(h.lifecycle.session().is_none());
        assert_eq!(h.media.releases(), 1);
        assert_eq!(
            h.signaling.sent(),
            vec![OutboundSignal::EndSession {
                session_id: "room-1".into()
            }]
        );
    }

    #[tokio::test]
    async fn skip_ends_and_requeues() {
        let mut h = harness(FakeMediaSource::new());
        h.lifecycle
            .handle_signal(paired(Role::Initiator, Some("bob")))
            .await
            .unwrap();
        h.signaling.take();

        h.lifecycle.skip().await.unwrap();
        assert_eq!(h.lifecycle.status(), SessionStatus::Waiting);
        assert!(h.factory.last().unwrap().is_closed());
        assert_eq!(
            h.signaling.sent(),
            vec![
                OutboundSignal::EndSession {
                    session_id: "room-1".into()
                },
                OutboundSignal::JoinQueue
            ]
        );
    }

    #[tokio::test]
    async fn accept_pairing_joins_the_queue() {
        let mut h = harness(FakeMediaSource::new());
        let mut status = h.lifecycle.subscribe();
        h.lifecycle.accept_pairing().await.unwrap();

        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), SessionStatus::Waiting);
        assert_eq!(h.signaling.sent(), vec![OutboundSignal::JoinQueue]);
    }

    #[tokio::test]
    async fn request_offer_needs_a_session() {
        let mut h = harness(FakeMediaSource::new());
        assert!(matches!(
            h.lifecycle.request_offer().await,
            Err(NegotiationError::NoActiveSession)
        ));
    }
}
