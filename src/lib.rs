//! Peer negotiation engine for anonymous one-to-one WebRTC sessions.
//!
//! The engine pairs with whoever the signaling relay hands it, runs the
//! offer/answer exchange with polite/impolite collision handling, buffers
//! early ICE candidates and recovers dropped connections with bounded ICE
//! restarts. Start it with [`commands::spawn_engine`].

pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use commands::{spawn_engine, EngineCommand, EngineHandle};
pub use config::EngineConfig;
pub use error::{NegotiationError, Result};
pub use session::{ChatEvent, Role, Session, SessionLifecycle, SessionStatus};
