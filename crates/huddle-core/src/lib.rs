//! Signaling core for mesh WebRTC calls over a broadcast relay.
//!
//! A [`CallHandle`] drives one participant: it owns a peer session per remote
//! identity, negotiates offers and answers over a [`SignalChannel`], and
//! reports what happens through an [`EventSink`]. Media and ICE are left to
//! a [`ConnectionFactory`] implementation.

pub mod call;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod events;
pub mod logging;
pub mod negotiation;
pub mod registry;
pub mod session;
pub mod transport;

pub use call::{
    CallCommand, CallHandle, CallService, CallSession, CallSnapshot, PeerSnapshot,
    ReconnectPolicy, spawn_call,
};
pub use config::CallConfig;
pub use connection::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionReport, ConnectionState,
    IceConnectionState, LocalStream, MediaSource, MediaTrack, NegotiableConnection, OfferOptions,
    RemoteStream, RemoteTrack, SignalingState, TrackKind,
};
pub use envelope::{Envelope, IceCandidate, PeerId, SdpType, SessionDescription};
pub use error::{CallError, ConnectionError, EnvelopeError, MediaError, TransportError};
pub use events::{CallEvent, ChannelSink, ChatMessage, EventSink};
pub use negotiation::Negotiator;
pub use registry::PeerRegistry;
pub use session::{NegotiationSide, PeerPhase, PeerSession, SkipReason, Step};
pub use transport::{
    ChannelEvent, LocalChannel, LocalHub, LocalIdentity, SignalChannel, WebSocketChannel,
};
