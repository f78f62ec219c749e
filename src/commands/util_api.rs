use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::Result;
use crate::peer::ice::CandidateKind;
use crate::peer::rtc::ice_servers;
use crate::peer::types::{IceCandidate, ServerConfig, ServerKind};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Candidate type proving that a server of `kind` answered.
pub fn expected_candidate(kind: ServerKind) -> CandidateKind {
    match kind {
        ServerKind::Stun => CandidateKind::ServerReflexive,
        ServerKind::Turn => CandidateKind::Relay,
    }
}

/// Checks one ICE server by gathering candidates against it alone.
pub async fn check_ice_server_availability(config: &ServerConfig) -> Result<bool> {
    probe_ice_server(config, PROBE_TIMEOUT).await
}

pub async fn probe_ice_server(config: &ServerConfig, within: Duration) -> Result<bool> {
    let wanted = expected_candidate(config.r#type);
    info!(server = %config.id, url = %config.url, %wanted, "probing ice server");

    let rtc_config = RTCConfiguration {
        ice_servers: ice_servers(std::slice::from_ref(config)),
        ..Default::default()
    };
    let api = APIBuilder::new().build();
    let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

    // `None` marks the end of gathering.
    let (seen_tx, mut seen_rx) = mpsc::channel::<Option<CandidateKind>>(16);
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = seen_tx.clone();
        Box::pin(async move {
            let seen = match cand {
                Some(cand) => match cand.to_json() {
                    Ok(init) => Some(CandidateKind::of(&IceCandidate::from(init))),
                    Err(err) => {
                        debug!(error = %err, "unreadable probe candidate");
                        return;
                    }
                },
                None => None,
            };
            let _ = tx.send(seen).await;
        })
    }));

    let found = gather(&pc, wanted, within, &mut seen_rx).await;
    if let Err(err) = pc.close().await {
        debug!(error = %err, "closing probe connection failed");
    }
    let found = found?;
    info!(server = %config.id, found, "ice server probe finished");
    Ok(found)
}

async fn gather(
    pc: &RTCPeerConnection,
    wanted: CandidateKind,
    within: Duration,
    seen_rx: &mut mpsc::Receiver<Option<CandidateKind>>,
) -> Result<bool> {
    // A data channel gives the offer something to gather for.
    pc.create_data_channel("probe", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    let wait = async {
        while let Some(seen) = seen_rx.recv().await {
            match seen {
                Some(kind) if kind == wanted => return true,
                Some(kind) => debug!(%kind, "probe candidate of another type"),
                None => return false,
            }
        }
        false
    };
    match timeout(within, wait).await {
        Ok(found) => Ok(found),
        Err(_) => {
            warn!(secs = within.as_secs(), "ice server probe timed out");
            Ok(false)
        }
    }
}
