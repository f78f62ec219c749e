//! `webrtc`-crate implementation of [`PeerFactory`] / [`PeerBackend`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::EngineConfig;
use crate::error::{NegotiationError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, TrackKind};
use crate::peer::backend::{PeerBackend, PeerEvent, PeerEventSender, PeerFactory};
use crate::peer::types::{
    ConnectivityState, Generation, IceCandidate, OfferOptions, SdpKind, ServerConfig,
    SessionDescription,
};
use crate::utils::add_ice_url_scheme;

/// Builds real peer connections from an [`EngineConfig`].
pub struct WebRtcPeerFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcPeerFactory {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            rtc_config: rtc_config(config),
        })
    }
}

/// Peer connection configuration for the engine's ICE servers.
pub fn rtc_config(config: &EngineConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&config.ice_servers),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        generation: Generation,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerBackend>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);
        wire_callbacks(&pc, generation, events);
        debug!(generation, "peer connection created");
        Ok(Arc::new(WebRtcPeer {
            generation,
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, generation: Generation, events: PeerEventSender) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(cand) = cand else {
                debug!(generation, "ice gathering complete");
                return;
            };
            match cand.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::from(init);
                    dump_candidate("LOCAL", &candidate);
                    let _ = events.send(PeerEvent::LocalCandidate {
                        generation,
                        candidate,
                    });
                }
                Err(err) => warn!(generation, error = %err, "could not serialize local candidate"),
            }
        })
    }));

    let state_events = events.clone();
    let stats_pc: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        let state = connectivity_from(st);
        info!(generation, ?state, "ice connection state changed");
        if matches!(state, ConnectivityState::Disconnected | ConnectivityState::Failed) {
            if let Some(pc) = stats_pc.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        let _ = state_events.send(PeerEvent::Connectivity { generation, state });
        Box::pin(async {})
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let _ = track_events.send(PeerEvent::RemoteTrack {
                generation,
                track_id: track.id(),
                kind,
            });
            Box::pin(async {})
        },
    ));

    pc.on_negotiation_needed(Box::new(move || {
        let _ = events.send(PeerEvent::NegotiationNeeded { generation });
        Box::pin(async {})
    }));
}

fn connectivity_from(state: RTCIceConnectionState) -> ConnectivityState {
    match state {
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        _ => ConnectivityState::New,
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(NegotiationError::Backend(format!(
            "unexpected local description type {other}"
        ))),
    }
}

pub struct WebRtcPeer {
    generation: Generation,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerBackend for WebRtcPeer {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let rtc_options = RTCOfferOptions {
            ice_restart: options.ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(rtc_options)).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self.pc.add_track(track.as_rtc_track()).await?;
        self.senders.lock().insert(track.id().to_owned(), sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let sender = self.senders.lock().remove(track_id);
        if let Some(sender) = sender {
            self.pc.remove_track(&sender).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc.close().await?;
        debug!(generation = self.generation, "peer connection closed");
        Ok(())
    }

    fn connectivity(&self) -> ConnectivityState {
        connectivity_from(self.pc.ice_connection_state())
    }
}
