//! Offer/answer protocol with polite/impolite collision handling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{NegotiationError, Result};
use crate::media::{LocalMedia, LocalTrack};
use crate::peer::backend::{PeerEventSender, PeerFactory};
use crate::peer::connection::ConnectionHandle;
use crate::peer::ice::CandidateBuffer;
use crate::peer::types::{
    Generation, IceCandidate, OfferOptions, SessionDescription, SignalingState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Send this to the peer.
    Created(SessionDescription),
    /// Another negotiation was already in flight.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferResponse {
    Answer(SessionDescription),
    /// Colliding offer dropped on the impolite side.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Completed,
    /// Stale or misdirected answer.
    Discarded,
}

/// Clears the `negotiating` flag on every exit path.
struct NegotiatingGuard<'a>(&'a AtomicBool);

impl Drop for NegotiatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct NegotiationCoordinator {
    factory: Arc<dyn PeerFactory>,
    events: PeerEventSender,
    generations: Arc<AtomicU64>,
    polite: bool,
    handle: Mutex<Option<Arc<ConnectionHandle>>>,
    replacing: tokio::sync::Mutex<()>,
    negotiating: AtomicBool,
    candidates: CandidateBuffer,
    tracks: Mutex<Vec<LocalTrack>>,
}

impl NegotiationCoordinator {
    /// `generations` is shared across sessions so that a generation number is
    /// never reused by the same engine.
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        events: PeerEventSender,
        generations: Arc<AtomicU64>,
        polite: bool,
    ) -> Self {
        Self {
            factory,
            events,
            generations,
            polite,
            handle: Mutex::new(None),
            replacing: tokio::sync::Mutex::new(()),
            negotiating: AtomicBool::new(false),
            candidates: CandidateBuffer::new(),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn is_negotiating(&self) -> bool {
        self.negotiating.load(Ordering::SeqCst)
    }

    pub fn current_handle(&self) -> Option<Arc<ConnectionHandle>> {
        self.handle.lock().clone()
    }

    pub fn current_generation(&self) -> Option<Generation> {
        self.handle.lock().as_ref().map(|h| h.generation())
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    fn live_handle(&self) -> Option<Arc<ConnectionHandle>> {
        self.handle.lock().clone().filter(|h| !h.is_closed())
    }

    /// Returns the live handle, creating a fresh one if there is none or the
    /// current one is closed.
    pub async fn ensure_handle(&self) -> Result<Arc<ConnectionHandle>> {
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }
        let _replacing = self.replacing.lock().await;
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }
        self.install_handle(false).await
    }

    /// Unconditionally swaps in a new connection generation.
    pub async fn replace_handle(&self) -> Result<Arc<ConnectionHandle>> {
        let _replacing = self.replacing.lock().await;
        self.install_handle(false).await
    }

    async fn install_handle(&self, keep_candidates: bool) -> Result<Arc<ConnectionHandle>> {
        let current = self.handle.lock().take();
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ConnectionHandle::replace(
            current,
            self.factory.as_ref(),
            generation,
            self.polite,
            self.events.clone(),
        )
        .await?;

        if keep_candidates {
            self.candidates.rebind(generation);
        } else {
            self.candidates.discard(generation);
        }
        let tracks = self.tracks.lock().clone();
        for track in &tracks {
            if let Err(err) = handle.add_track(track).await {
                warn!(
                    generation,
                    track = track.id(),
                    error = %err,
                    "track rejected, dropping new connection"
                );
                handle.close().await;
                return Err(err);
            }
        }
        *self.handle.lock() = Some(handle.clone());
        Ok(handle)
    }

    pub async fn request_offer(&self) -> Result<OfferOutcome> {
        self.make_offer(OfferOptions::default()).await
    }

    /// Offer with fresh ICE credentials, used to recover connectivity
    /// without re-pairing.
    pub async fn request_restart_offer(&self) -> Result<OfferOutcome> {
        self.make_offer(OfferOptions::ice_restart()).await
    }

    async fn make_offer(&self, options: OfferOptions) -> Result<OfferOutcome> {
        if self
            .negotiating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("negotiation already in flight, offer skipped");
            return Ok(OfferOutcome::Skipped);
        }
        let _negotiating = NegotiatingGuard(&self.negotiating);

        let handle = self.ensure_handle().await?;
        let generation = handle.generation();
        let offer = handle.create_local_offer(options).await?;

        if self.current_generation() != Some(generation) {
            return Err(NegotiationError::StaleHandle { generation });
        }
        if handle.signaling_state() != SignalingState::HaveLocalOffer {
            info!(generation, "local offer superseded by remote offer");
            return Ok(OfferOutcome::Skipped);
        }
        Ok(OfferOutcome::Created(offer))
    }

    pub async fn receive_offer(&self, description: SessionDescription) -> Result<OfferResponse> {
        let handle = self.ensure_handle().await?;
        let collision =
            self.is_negotiating() || handle.signaling_state() == SignalingState::HaveLocalOffer;

        if collision && !self.polite {
            info!(
                generation = handle.generation(),
                "offer collision, keeping local offer"
            );
            return Ok(OfferResponse::Ignored);
        }
        if collision {
            info!(
                generation = handle.generation(),
                "offer collision, yielding to remote offer"
            );
        }

        let applied = handle.apply_remote_description(description.clone()).await;
        let handle = match applied {
            Ok(()) => handle,
            Err(err) if collision && !matches!(err, NegotiationError::InvalidState { .. }) => {
                warn!(
                    generation = handle.generation(),
                    error = %err,
                    "rollback failed, answering on a fresh connection"
                );
                let fresh = {
                    let _replacing = self.replacing.lock().await;
                    self.install_handle(true).await?
                };
                fresh.apply_remote_description(description).await?;
                fresh
            }
            Err(err) => return Err(err),
        };

        self.candidates.flush(&handle).await;
        let answer = handle.create_local_answer().await?;
        if self.current_generation() != Some(handle.generation()) {
            return Err(NegotiationError::StaleHandle {
                generation: handle.generation(),
            });
        }
        Ok(OfferResponse::Answer(answer))
    }

    pub async fn receive_answer(&self, description: SessionDescription) -> Result<AnswerOutcome> {
        let Some(handle) = self.live_handle() else {
            debug!("answer without a connection, discarded");
            return Ok(AnswerOutcome::Discarded);
        };
        if handle.signaling_state() != SignalingState::HaveLocalOffer {
            debug!(
                generation = handle.generation(),
                state = ?handle.signaling_state(),
                "unexpected answer, discarded"
            );
            return Ok(AnswerOutcome::Discarded);
        }
        match handle.apply_remote_description(description).await {
            Ok(()) => {}
            Err(NegotiationError::InvalidState { state, .. }) => {
                debug!(?state, "answer raced a state change, discarded");
                return Ok(AnswerOutcome::Discarded);
            }
            Err(err) => return Err(err),
        }
        self.candidates.flush(&handle).await;
        Ok(AnswerOutcome::Completed)
    }

    /// Buffers the candidate for the current generation and applies whatever
    /// is applicable. Returns the number of candidates applied.
    pub async fn receive_candidate(&self, candidate: IceCandidate) -> Result<usize> {
        let handle = self.ensure_handle().await?;
        self.candidates.enqueue(handle.generation(), candidate);
        Ok(self.candidates.flush(&handle).await)
    }

    /// Buffers a remote candidate for the live connection without waiting on
    /// any in-flight operation. Hands the candidate back when there is no
    /// live connection to tag it with.
    pub fn buffer_candidate(&self, candidate: IceCandidate) -> Result<Generation, IceCandidate> {
        match self.live_handle() {
            Some(handle) => {
                self.candidates.enqueue(handle.generation(), candidate);
                Ok(handle.generation())
            }
            None => Err(candidate),
        }
    }

    pub async fn flush_candidates(&self) -> usize {
        match self.live_handle() {
            Some(handle) => self.candidates.flush(&handle).await,
            None => 0,
        }
    }

    /// Remembers the session's tracks and adds them to the live connection.
    /// Every later generation gets them as well.
    pub async fn attach_tracks(&self, media: &LocalMedia) -> Result<usize> {
        {
            let mut tracks = self.tracks.lock();
            for track in media.tracks() {
                if !tracks.iter().any(|t| t.id() == track.id()) {
                    tracks.push(track.clone());
                }
            }
        }
        self.sync_tracks().await
    }

    /// Adds remembered tracks missing from the live connection.
    pub async fn sync_tracks(&self) -> Result<usize> {
        let Some(handle) = self.live_handle() else {
            return Ok(0);
        };
        let tracks = self.tracks.lock().clone();
        let mut added = 0;
        for track in &tracks {
            if handle.add_track(track).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn detach_tracks(&self) -> Result<()> {
        let tracks = std::mem::take(&mut *self.tracks.lock());
        if let Some(handle) = self.live_handle() {
            for track in &tracks {
                handle.remove_track(track.id()).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.candidates.clear();
    }

    /// Closes the connection and forgets all per-session negotiation state.
    pub async fn reset(&self) {
        self.close().await;
        self.tracks.lock().clear();
        self.negotiating.store(false, Ordering::SeqCst);
    }
}
