//! `webrtc`-backed connection factory and media source for huddle calls.

pub mod api;
pub mod connection;
pub mod convert;
pub mod media;

pub use api::{DEFAULT_STUN_SERVER, RtcConfig, virtual_lan};
pub use connection::{RtcConnection, RtcConnectionFactory};
pub use media::{PlaceholderMedia, RtcLocalTrack};
