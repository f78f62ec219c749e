//! Local media as seen by the negotiation engine.
//!
//! The engine never looks inside a track: it only hands tracks to the peer
//! connection and takes them away again. Capture and rendering belong to the
//! [`MediaSource`] implementation supplied by the embedding application.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::Result;
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// One outgoing track. Cloning shares the underlying sample sink, so the
/// capture side keeps writing into the same track the connection sends.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    sink: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sink = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.into(),
        ));
        Self { id, kind, sink }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Sample sink the capture pipeline writes into.
    pub fn sink(&self) -> &Arc<TrackLocalStaticSample> {
        &self.sink
    }

    pub(crate) fn as_rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.sink) as Arc<dyn TrackLocal + Send + Sync>
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The local stream: a stream id plus its tracks.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    /// Audio and video track pair under a fresh stream id.
    pub fn audio_video() -> Self {
        let stream_id = format!("stream-{}", random_id());
        let tracks = vec![
            LocalTrack::new(format!("audio-{}", random_id()), TrackKind::Audio, &stream_id),
            LocalTrack::new(format!("video-{}", random_id()), TrackKind::Video, &stream_id),
        ];
        Self { stream_id, tracks }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }
}

/// Media-capture collaborator.
///
/// `acquire` fails with [`NegotiationError::MediaAcquisitionFailed`] when no
/// stream can be produced (device busy, permission denied).
///
/// [`NegotiationError::MediaAcquisitionFailed`]: crate::error::NegotiationError::MediaAcquisitionFailed
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia>;

    /// Stops capture for a stream previously returned by `acquire`.
    fn release(&self, media: &LocalMedia);
}

/// Source handing out sample-fed tracks. The application pushes encoded
/// samples into [`LocalTrack::sink`]; nothing is captured here.
#[derive(Debug, Default)]
pub struct SampleMediaSource;

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self) -> Result<LocalMedia> {
        let media = LocalMedia::audio_video();
        info!(stream_id = media.stream_id(), "local media acquired");
        Ok(media)
    }

    fn release(&self, media: &LocalMedia) {
        debug!(stream_id = media.stream_id(), "local media released");
    }
}
