//! Duplex channel to the signaling relay.
//!
//! Outbound envelopes go through [`SignalChannel::send`]; inbound traffic and
//! link changes arrive as [`ChannelEvent`]s on the receiver returned when the
//! channel is created. No ordering is assumed across peers.

use crate::envelope::{Envelope, PeerId};
use crate::error::TransportError;

pub mod local;
pub mod websocket;

pub use local::{LocalChannel, LocalHub};
pub use websocket::WebSocketChannel;

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Opened,
    Envelope(Envelope),
    Closed,
}

pub trait SignalChannel: Send + Sync {
    fn is_open(&self) -> bool;
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Who this client is on the relay; announced with a `join` on every open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: PeerId,
    pub username: String,
}

impl LocalIdentity {
    pub fn new(id: impl Into<PeerId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }

    pub(crate) fn join_envelope(&self) -> Envelope {
        Envelope::Join {
            user_id: self.id.clone(),
            username: self.username.clone(),
        }
    }
}
