//! Seam between the engine's bookkeeping and the actual peer connection.
//!
//! [`ConnectionHandle`](super::connection::ConnectionHandle) owns the signaling
//! state machine; a [`PeerBackend`] only executes the primitive operations.
//! The production backend lives in [`super::rtc`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::types::{ConnectivityState, Generation, IceCandidate, OfferOptions, SessionDescription};

/// Callbacks raised by a peer connection, tagged with its generation.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate {
        generation: Generation,
        candidate: IceCandidate,
    },
    Connectivity {
        generation: Generation,
        state: ConnectivityState,
    },
    RemoteTrack {
        generation: Generation,
        track_id: String,
        kind: TrackKind,
    },
    NegotiationNeeded {
        generation: Generation,
    },
}

impl PeerEvent {
    pub fn generation(&self) -> Generation {
        match self {
            PeerEvent::LocalCandidate { generation, .. }
            | PeerEvent::Connectivity { generation, .. }
            | PeerEvent::RemoteTrack { generation, .. }
            | PeerEvent::NegotiationNeeded { generation } => *generation,
        }
    }
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    /// Drops the pending local offer and returns to stable.
    async fn rollback(&self) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;
    async fn remove_track(&self, track_id: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
    /// Current ICE connection state, read without waiting on any callback.
    fn connectivity(&self) -> ConnectivityState;
}

/// Allocates peer connections. Every backend it creates reports its
/// callbacks on `events`, tagged with `generation`.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        generation: Generation,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerBackend>>;
}
