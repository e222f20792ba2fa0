//! [`NegotiableConnection`] over a `webrtc` peer connection.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{
    ConnectionError, ConnectionEvents, ConnectionFactory, ConnectionState, IceCandidate,
    MediaTrack, NegotiableConnection, OfferOptions, PeerId, RemoteTrack, SessionDescription,
    SignalingState, TrackKind,
};
use webrtc::api::API;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::api::{RtcConfig, build_api};
use crate::convert::{
    backend_error, codec_type, connection_state, description_error, from_rtc_candidate,
    from_rtc_description, ice_connection_state, signaling_state, to_rtc_candidate,
    to_rtc_description, track_kind,
};
use crate::media::RtcLocalTrack;

const TARGET: &str = "huddle::rtc::connection";

/// Opens one `webrtc` peer connection per remote participant.
pub struct RtcConnectionFactory {
    api: API,
    config: RtcConfig,
}

impl RtcConnectionFactory {
    pub fn new(config: RtcConfig) -> Result<Self, ConnectionError> {
        let setting = config.setting_engine();
        Self::with_setting_engine(config, setting)
    }

    /// Uses `setting` as-is; the config's ICE timeouts are not reapplied.
    pub fn with_setting_engine(
        config: RtcConfig,
        setting: SettingEngine,
    ) -> Result<Self, ConnectionError> {
        Ok(Self {
            api: build_api(setting)?,
            config,
        })
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn open(
        &self,
        peer: &PeerId,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn NegotiableConnection>, ConnectionError> {
        let pc = self
            .api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(backend_error)?;
        let pc = Arc::new(pc);
        wire_handlers(&pc, events);
        tracing::debug!(target = TARGET, peer = %peer, "peer connection created");
        Ok(Arc::new(RtcConnection {
            peer: peer.clone(),
            pc,
        }))
    }
}

fn wire_handlers(pc: &RTCPeerConnection, events: ConnectionEvents) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.local_candidate(from_rtc_candidate(init)),
                Err(err) => tracing::warn!(
                    target = TARGET,
                    peer = %events.peer(),
                    error = %err,
                    "failed to serialize local candidate"
                ),
            }
        })
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = track_events.clone();
            Box::pin(async move {
                let Some(kind) = track_kind(track.kind()) else {
                    tracing::debug!(target = TARGET, peer = %events.peer(), "ignoring track of unknown kind");
                    return;
                };
                let id = track.id().to_string();
                let handle: Arc<dyn Any + Send + Sync> = track;
                events.track(RemoteTrack {
                    id,
                    kind,
                    handle: Some(handle),
                });
            })
        },
    ));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        state_events.state(connection_state(state));
        Box::pin(async {})
    }));

    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        events.ice_state(ice_connection_state(state));
        Box::pin(async {})
    }));
}

pub struct RtcConnection {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
}

impl RtcConnection {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Adds a receive-only transceiver for `kind` unless one of that kind
    /// already exists.
    async fn ensure_receiver(&self, kind: TrackKind) -> Result<(), ConnectionError> {
        let codec = codec_type(kind);
        let transceivers = self.pc.get_transceivers().await;
        if transceivers.iter().any(|t| t.kind() == codec) {
            return Ok(());
        }
        self.pc
            .add_transceiver_from_kind(
                codec,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}

#[async_trait]
impl NegotiableConnection for RtcConnection {
    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, ConnectionError> {
        if options.offer_to_receive_audio {
            self.ensure_receiver(TrackKind::Audio).await?;
        }
        if options.offer_to_receive_video {
            self.ensure_receiver(TrackKind::Video).await?;
        }
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(description_error)?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(description_error)?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(description_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(description_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|err| ConnectionError::Candidate(err.to_string()))
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), ConnectionError> {
        let Some(local) = track.as_any().downcast_ref::<RtcLocalTrack>() else {
            return Err(ConnectionError::Unsupported(format!(
                "track {} is not backed by a webrtc track",
                track.id()
            )));
        };
        let sample: Arc<dyn TrackLocal + Send + Sync> = local.sample_track();
        let sender = self.pc.add_track(sample).await.map_err(backend_error)?;

        // Drain RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        tracing::debug!(target = TARGET, peer = %self.peer, track = %track.id(), "local track attached");
        Ok(())
    }

    async fn sender_track_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(track.id().to_owned());
            }
        }
        ids
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pc.close().await.map_err(backend_error)
    }
}
