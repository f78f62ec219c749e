use thiserror::Error;

use crate::peer::types::{Generation, SignalingState};

/// Errors raised by the negotiation engine.
///
/// Every variant is scoped to a single session: the lifecycle resolves them by
/// discarding the operation, retrying on a fresh connection, or tearing the
/// session down. None of them should take the process down.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("`{operation}` is not allowed in signaling state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },
    #[error("connection generation {generation} has been superseded")]
    StaleHandle { generation: Generation },
    #[error("local media unavailable: {0}")]
    MediaAcquisitionFailed(String),
    #[error("ice restart gave up after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
    #[error("no active session")]
    NoActiveSession,
    #[error("peer connection error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("peer backend error: {0}")]
    Backend(String),
    #[error("signaling channel error: {0}")]
    Signaling(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NegotiationError {
    /// `true` for errors the engine recovers from by discarding or retrying
    /// the operation without touching the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NegotiationError::InvalidState { .. } | NegotiationError::StaleHandle { .. }
        )
    }
}

pub type Result<T, E = NegotiationError> = std::result::Result<T, E>;
