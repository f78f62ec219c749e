use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::error::{NegotiationError, Result};
use crate::peer::ice::CandidateKind;
use crate::peer::types::IceCandidate;

/// Environment variable holding the `tracing` filter directive.
pub const LOG_ENV: &str = "PAIRLINK_LOG";

#[cfg(debug_assertions)]
const DEFAULT_DIRECTIVE: &str = "pairlink=debug,webrtc=warn";
#[cfg(not(debug_assertions))]
const DEFAULT_DIRECTIVE: &str = "pairlink=warn";

/// Installs the global subscriber. `PAIRLINK_LOG` wins over `directive`.
/// Fails if the directive does not parse or a subscriber is already set.
pub fn try_init(directive: &str) -> Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(from_env) => EnvFilter::try_new(from_env),
        Err(_) => EnvFilter::try_new(directive),
    }
    .map_err(|e| NegotiationError::Config(format!("bad log filter: {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| NegotiationError::Config(format!("logger already installed: {e}")))
}

/// Same as [`try_init`] with the build's default filter; a second call is a no-op.
pub fn init() {
    let _ = try_init(DEFAULT_DIRECTIVE);
}

/// Trickle ICE trace for one candidate.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        label,
        kind = %CandidateKind::of(cand),
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}

/// Quick getStats snapshot of the nominated pair.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparsable_directive() {
        if std::env::var(LOG_ENV).is_ok() {
            return;
        }
        let err = try_init("pairlink=loudest").unwrap_err();
        assert!(matches!(err, NegotiationError::Config(_)));
    }

    #[test]
    fn init_twice_is_harmless() {
        init();
        init();
    }
}
