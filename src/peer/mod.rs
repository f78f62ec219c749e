pub mod backend;
pub mod connection;
pub mod health;
pub mod ice;
pub mod negotiation;
pub mod rtc;
pub mod types;

pub use backend::{PeerBackend, PeerEvent, PeerFactory};
pub use connection::ConnectionHandle;
pub use health::{HealthAction, HealthMonitor, TeardownReason};
pub use ice::{CandidateBuffer, CandidateKind};
pub use negotiation::{AnswerOutcome, NegotiationCoordinator, OfferOutcome, OfferResponse};
pub use rtc::WebRtcPeerFactory;
pub use types::{
    ConnectivityState, Generation, IceCandidate, OfferOptions, SdpKind, ServerConfig, ServerKind,
    SessionDescription, SignalingState,
};
