//! One incarnation of the peer connection plus its signaling state machine.
//!
//! Every signaling transition runs under `signaling_op`, so two transitions on
//! the same handle never interleave. The short `state` lock is never held
//! across an await.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{NegotiationError, Result};
use crate::media::LocalTrack;
use crate::peer::backend::{PeerBackend, PeerEventSender, PeerFactory};
use crate::peer::types::{
    ConnectivityState, Generation, IceCandidate, OfferOptions, SdpKind, SessionDescription,
    SignalingState,
};

#[derive(Debug)]
struct HandleState {
    signaling: SignalingState,
    remote_description: bool,
    senders: HashSet<String>,
}

pub struct ConnectionHandle {
    generation: Generation,
    polite: bool,
    peer: Arc<dyn PeerBackend>,
    signaling_op: tokio::sync::Mutex<()>,
    state: Mutex<HandleState>,
}

impl ConnectionHandle {
    pub async fn create(
        factory: &dyn PeerFactory,
        generation: Generation,
        polite: bool,
        events: PeerEventSender,
    ) -> Result<Arc<Self>> {
        let peer = factory.create(generation, events).await?;
        debug!(generation, polite, "connection handle created");
        Ok(Arc::new(Self {
            generation,
            polite,
            peer,
            signaling_op: tokio::sync::Mutex::new(()),
            state: Mutex::new(HandleState {
                signaling: SignalingState::Stable,
                remote_description: false,
                senders: HashSet::new(),
            }),
        }))
    }

    /// Closes `current` (if any) before building its successor, so at most
    /// one live connection exists at a time.
    pub async fn replace(
        current: Option<Arc<Self>>,
        factory: &dyn PeerFactory,
        generation: Generation,
        polite: bool,
        events: PeerEventSender,
    ) -> Result<Arc<Self>> {
        if let Some(old) = current {
            info!(
                old = old.generation,
                new = generation,
                "replacing connection"
            );
            old.close().await;
        }
        Self::create(factory, generation, polite, events).await
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    /// Transport state as the peer connection reports it right now, not as
    /// of the last event the lifecycle processed.
    pub fn connectivity_state(&self) -> ConnectivityState {
        if self.is_closed() {
            ConnectivityState::Closed
        } else {
            self.peer.connectivity()
        }
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    /// Idempotent. Once closed every operation fails with `StaleHandle`.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.signaling = SignalingState::Closed;
            state.senders.clear();
        }
        if let Err(err) = self.peer.close().await {
            warn!(generation = self.generation, error = %err, "closing peer connection failed");
        }
        debug!(generation = self.generation, "connection handle closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(NegotiationError::StaleHandle {
                generation: self.generation,
            })
        } else {
            Ok(())
        }
    }

    fn require_state(&self, operation: &'static str, expected: SignalingState) -> Result<()> {
        let state = self.signaling_state();
        if state == SignalingState::Closed {
            return Err(NegotiationError::StaleHandle {
                generation: self.generation,
            });
        }
        if state != expected {
            return Err(NegotiationError::InvalidState { operation, state });
        }
        Ok(())
    }

    fn set_signaling(&self, signaling: SignalingState) {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::Closed {
            state.signaling = signaling;
        }
    }

    /// Stable -> HaveLocalOffer.
    pub async fn create_local_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let _op = self.signaling_op.lock().await;
        self.require_state("create_local_offer", SignalingState::Stable)?;

        let offer = self.peer.create_offer(options).await?;
        self.ensure_open()?;
        self.peer.set_local_description(offer.clone()).await?;
        self.ensure_open()?;
        self.set_signaling(SignalingState::HaveLocalOffer);
        debug!(
            generation = self.generation,
            ice_restart = options.ice_restart,
            "local offer set"
        );
        Ok(offer)
    }

    /// Applies an offer or answer from the peer.
    ///
    /// An offer arriving while our own offer is pending is only accepted on
    /// the polite side, which rolls its offer back first.
    pub async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        let _op = self.signaling_op.lock().await;
        self.ensure_open()?;
        let state = self.signaling_state();

        let next = match (description.kind, state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Offer, SignalingState::HaveLocalOffer) if self.polite => {
                self.peer.rollback().await?;
                self.ensure_open()?;
                self.set_signaling(SignalingState::Stable);
                info!(generation = self.generation, "rolled back local offer");
                SignalingState::HaveRemoteOffer
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (SdpKind::Offer, _) => {
                return Err(NegotiationError::InvalidState {
                    operation: "apply_remote_offer",
                    state,
                })
            }
            (SdpKind::Answer, _) => {
                return Err(NegotiationError::InvalidState {
                    operation: "apply_remote_answer",
                    state,
                })
            }
        };

        self.peer.set_remote_description(description).await?;
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            state.signaling = next;
            state.remote_description = true;
        }
        debug!(generation = self.generation, state = ?next, "remote description applied");
        Ok(())
    }

    /// HaveRemoteOffer -> Stable.
    pub async fn create_local_answer(&self) -> Result<SessionDescription> {
        let _op = self.signaling_op.lock().await;
        self.require_state("create_local_answer", SignalingState::HaveRemoteOffer)?;

        let answer = self.peer.create_answer().await?;
        self.ensure_open()?;
        self.peer.set_local_description(answer.clone()).await?;
        self.ensure_open()?;
        self.set_signaling(SignalingState::Stable);
        debug!(generation = self.generation, "local answer set");
        Ok(answer)
    }

    /// Only valid once a remote description is in place; callers buffer
    /// candidates until then.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if !self.has_remote_description() {
            return Err(NegotiationError::InvalidState {
                operation: "add_remote_candidate",
                state: self.signaling_state(),
            });
        }
        self.peer.add_ice_candidate(candidate).await
    }

    /// Returns `false` when a sender for this track already exists.
    pub async fn add_track(&self, track: &LocalTrack) -> Result<bool> {
        self.ensure_open()?;
        if !self.state.lock().senders.insert(track.id().to_owned()) {
            return Ok(false);
        }
        if let Err(err) = self.peer.add_track(track).await {
            self.state.lock().senders.remove(track.id());
            return Err(err);
        }
        Ok(true)
    }

    /// Returns `false` when there was no sender for `track_id`.
    pub async fn remove_track(&self, track_id: &str) -> Result<bool> {
        self.ensure_open()?;
        if !self.state.lock().senders.remove(track_id) {
            return Ok(false);
        }
        self.peer.remove_track(track_id).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .field("polite", &self.polite)
            .field("state", &*self.state.lock())
            .finish()
    }
}
