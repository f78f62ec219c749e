//! In-memory collaborators for driving the engine without a network.
//!
//! Enabled for unit tests and, through the `test-util` feature, for the
//! integration tests under `tests/`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{NegotiationError, Result};
use crate::media::{LocalMedia, MediaSource};
use crate::peer::backend::{PeerBackend, PeerEvent, PeerEventSender, PeerFactory};
use crate::peer::types::{
    ConnectivityState, Generation, IceCandidate, OfferOptions, SessionDescription,
};
use crate::signaling::{InboundSignal, OutboundSignal, SignalingChannel};

/// Factory handing out [`FakePeer`]s and keeping every one it created.
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail_rollback: Arc<AtomicBool>,
    fail_tracks: Arc<AtomicBool>,
    offer_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rollbacks on every peer (existing or future) fail from now on.
    pub fn fail_rollbacks(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    /// `add_track` on every peer fails from now on.
    pub fn fail_tracks(&self) {
        self.fail_tracks.store(true, Ordering::SeqCst);
    }

    /// Peers created after this call park in `create_offer` until the
    /// returned gate is notified once per offer.
    pub fn gate_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        generation: Generation,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerBackend>> {
        let peer = Arc::new(FakePeer {
            generation,
            events,
            fail_rollback: self.fail_rollback.clone(),
            fail_tracks: self.fail_tracks.clone(),
            connectivity: Mutex::new(ConnectivityState::New),
            offer_gate: self.offer_gate.lock().clone(),
            offers_started: AtomicUsize::new(0),
            log: Mutex::new(PeerLog::default()),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Debug, Default)]
struct PeerLog {
    offers: Vec<OfferOptions>,
    tracks_at_offer: Vec<usize>,
    answers: usize,
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    tracks: Vec<String>,
    rollbacks: usize,
    closed: bool,
}

/// Records every call; SDP bodies encode generation and sequence number.
pub struct FakePeer {
    generation: Generation,
    events: PeerEventSender,
    fail_rollback: Arc<AtomicBool>,
    fail_tracks: Arc<AtomicBool>,
    connectivity: Mutex<ConnectivityState>,
    offer_gate: Option<Arc<Notify>>,
    offers_started: AtomicUsize,
    log: Mutex<PeerLog>,
}

impl FakePeer {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Raises a connectivity change as the real connection would.
    pub fn emit_connectivity(&self, state: ConnectivityState) {
        *self.connectivity.lock() = state;
        let _ = self.events.send(PeerEvent::Connectivity {
            generation: self.generation,
            state,
        });
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(PeerEvent::LocalCandidate {
            generation: self.generation,
            candidate,
        });
    }

    pub fn offers_started(&self) -> usize {
        self.offers_started.load(Ordering::SeqCst)
    }

    pub fn offers(&self) -> usize {
        self.log.lock().offers.len()
    }

    pub fn restart_offers(&self) -> usize {
        self.log.lock().offers.iter().filter(|o| o.ice_restart).count()
    }

    /// Number of attached tracks at the time of each offer.
    pub fn tracks_at_offer(&self) -> Vec<usize> {
        self.log.lock().tracks_at_offer.clone()
    }

    pub fn answers(&self) -> usize {
        self.log.lock().answers
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.log.lock().local.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.log.lock().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.log.lock().candidates.clone()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.log.lock().tracks.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.log.lock().rollbacks
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }
}

#[async_trait]
impl PeerBackend for FakePeer {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        self.offers_started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        let mut log = self.log.lock();
        log.offers.push(options);
        let attached = log.tracks.len();
        log.tracks_at_offer.push(attached);
        let suffix = if options.ice_restart { "-restart" } else { "" };
        Ok(SessionDescription::offer(format!(
            "offer-{}-{}{}",
            self.generation,
            log.offers.len(),
            suffix
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut log = self.log.lock();
        log.answers += 1;
        Ok(SessionDescription::answer(format!(
            "answer-{}-{}",
            self.generation, log.answers
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.log.lock().local.push(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.log.lock().remote.push(description);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(NegotiationError::Backend("rollback rejected".into()));
        }
        self.log.lock().rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.contains("invalid") {
            return Err(NegotiationError::Backend(format!(
                "malformed candidate `{}`",
                candidate.candidate
            )));
        }
        self.log.lock().candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &crate::media::LocalTrack) -> Result<()> {
        if self.fail_tracks.load(Ordering::SeqCst) {
            return Err(NegotiationError::Backend("no sender for track".into()));
        }
        self.log.lock().tracks.push(track.id().to_owned());
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        self.log.lock().tracks.retain(|id| id != track_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().closed = true;
        Ok(())
    }

    fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.lock()
    }
}

/// Signaling channel that just remembers what was sent.
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<OutboundSignal>>,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().clone()
    }

    /// Drains everything recorded so far.
    pub fn take(&self) -> Vec<OutboundSignal> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        self.sent.lock().push(signal);
        Ok(())
    }
}

/// What the relay would deliver to the addressee of `signal`, sent by `from`.
/// Room-control messages have no peer counterpart and map to `None`.
pub fn relay(from: &str, signal: OutboundSignal) -> Option<InboundSignal> {
    match signal {
        OutboundSignal::Offer { description, .. } => Some(InboundSignal::Offer {
            peer_identity: from.to_owned(),
            description,
        }),
        OutboundSignal::Answer { description, .. } => Some(InboundSignal::Answer {
            peer_identity: from.to_owned(),
            description,
        }),
        OutboundSignal::Candidate { candidate, .. } => Some(InboundSignal::Candidate {
            peer_identity: from.to_owned(),
            candidate,
        }),
        OutboundSignal::ChatMessage { message, .. } => {
            Some(InboundSignal::ChatMessage { message })
        }
        OutboundSignal::JoinQueue | OutboundSignal::EndSession { .. } => None,
    }
}

/// Media source whose acquisition can be made to fail.
#[derive(Default)]
pub struct FakeMediaSource {
    fail: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let source = Self::default();
        source.fail.store(true, Ordering::SeqCst);
        source
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self) -> Result<LocalMedia> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NegotiationError::MediaAcquisitionFailed(
                "camera busy".into(),
            ));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia::audio_video())
    }

    fn release(&self, _media: &LocalMedia) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
