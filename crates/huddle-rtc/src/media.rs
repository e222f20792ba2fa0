use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use huddle_core::{LocalStream, MediaError, MediaSource, MediaTrack, TrackKind};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const TARGET: &str = "huddle::rtc::media";

/// A local track backed by a sample-fed `webrtc` track. Frames are written by
/// whoever owns the capture pipeline through [`RtcLocalTrack::sample_track`].
pub struct RtcLocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl RtcLocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        let track = TrackLocalStaticSample::new(
            capability,
            Uuid::new_v4().to_string(),
            stream_id.to_owned(),
        );
        Self {
            kind,
            track: Arc::new(track),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RtcLocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcLocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl MediaTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(target = TARGET, track = %self.id(), "local track stopped");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media source producing one VP8 video and one Opus audio track per call.
/// Nothing feeds samples into them; they carry negotiation only.
#[derive(Debug, Clone)]
pub struct PlaceholderMedia {
    audio: bool,
    video: bool,
}

impl Default for PlaceholderMedia {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl PlaceholderMedia {
    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }
}

#[async_trait]
impl MediaSource for PlaceholderMedia {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if !self.audio && !self.video {
            return Err(MediaError::Unavailable("no audio or video requested".into()));
        }
        let stream_id = Uuid::new_v4().to_string();
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if self.video {
            tracks.push(Arc::new(RtcLocalTrack::new(TrackKind::Video, &stream_id)));
        }
        if self.audio {
            tracks.push(Arc::new(RtcLocalTrack::new(TrackKind::Audio, &stream_id)));
        }
        tracing::debug!(target = TARGET, stream = %stream_id, tracks = tracks.len(), "acquired local stream");
        Ok(LocalStream::new(tracks))
    }
}
