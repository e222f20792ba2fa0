//! Capability boundary to the media/connection collaborator.
//!
//! The core never touches ICE or SDP internals. It drives a
//! [`NegotiableConnection`] and listens to the reports the connection pushes
//! through its [`ConnectionEvents`] handle.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::call::CallCommand;
use crate::envelope::{IceCandidate, PeerId, SessionDescription};
use crate::error::{ConnectionError, MediaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the connection will not recover on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
            ice_restart: false,
        }
    }
}

impl OfferOptions {
    pub fn ice_restart() -> Self {
        Self {
            ice_restart: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// An outbound track owned by the local stream. Identity is the track id,
/// never its content.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Acquires the local outbound stream when a call is joined.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream, MediaError>;
}

/// A track received from a remote participant. `handle` carries the
/// backend's own track object for renderers that know its concrete type.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            handle: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// Aggregate of inbound tracks for one participant. Shared by reference with
/// the event sink so renderers see tracks added after the stream was
/// announced.
#[derive(Debug)]
pub struct RemoteStream {
    peer: PeerId,
    tracks: RwLock<Vec<RemoteTrack>>,
}

impl RemoteStream {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            tracks: RwLock::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Returns false when a track with the same id is already present.
    pub fn add_track(&self, track: RemoteTrack) -> bool {
        let mut guard = self.tracks.write();
        if guard.iter().any(|existing| existing.id == track.id) {
            return false;
        }
        guard.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    Track(RemoteTrack),
    StateChanged(ConnectionState),
    IceStateChanged(IceConnectionState),
}

/// A connection report tagged with the session generation that produced it.
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub peer: PeerId,
    pub generation: u64,
    pub event: ConnectionEvent,
}

/// Handed to a connection at creation; every report lands on the call's
/// task queue. Reports sent after the call task stops are dropped.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    peer: PeerId,
    generation: u64,
    queue: mpsc::UnboundedSender<CallCommand>,
}

impl ConnectionEvents {
    pub fn new(peer: PeerId, generation: u64, queue: mpsc::UnboundedSender<CallCommand>) -> Self {
        Self {
            peer,
            generation,
            queue,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.report(ConnectionEvent::LocalCandidate(candidate));
    }

    pub fn track(&self, track: RemoteTrack) {
        self.report(ConnectionEvent::Track(track));
    }

    pub fn state(&self, state: ConnectionState) {
        self.report(ConnectionEvent::StateChanged(state));
    }

    pub fn ice_state(&self, state: IceConnectionState) {
        self.report(ConnectionEvent::IceStateChanged(state));
    }

    fn report(&self, event: ConnectionEvent) {
        let report = ConnectionReport {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        };
        if self.queue.send(CallCommand::Connection(report)).is_err() {
            tracing::trace!(
                target = "huddle::connection",
                peer = %self.peer,
                generation = self.generation,
                "call queue closed; dropping connection report"
            );
        }
    }
}

/// The negotiable connection the state machine drives. Implementations must
/// tolerate a candidate being applied more than once.
#[async_trait]
pub trait NegotiableConnection: Send + Sync {
    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, ConnectionError>;
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), ConnectionError>;
    /// Ids of the local tracks currently attached to senders.
    async fn sender_track_ids(&self) -> Vec<String>;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    async fn close(&self) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(
        &self,
        peer: &PeerId,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn NegotiableConnection>, ConnectionError>;
}
