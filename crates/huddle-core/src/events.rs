//! Observer boundary toward the UI. The core calls [`EventSink::emit`]
//! synchronously after each transition and never waits on the observer.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::connection::{ConnectionState, RemoteStream};
use crate::envelope::PeerId;

/// Chat message as the UI consumes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: Value,
    pub sender: PeerId,
    pub sender_username: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    RemoteStreamAdded {
        peer: PeerId,
        stream: Arc<RemoteStream>,
    },
    RemoteStreamRemoved {
        peer: PeerId,
    },
    ParticipantJoined {
        peer: PeerId,
    },
    ParticipantLeft {
        peer: PeerId,
    },
    UsersUpdated {
        users: Vec<Value>,
    },
    UserOnline {
        peer: PeerId,
        username: String,
    },
    ChatMessage(ChatMessage),
    ChatHistory(Vec<ChatMessage>),
    TypingChanged {
        peer: PeerId,
        is_typing: bool,
        conversation: String,
    },
    PeerConnectionState {
        peer: PeerId,
        state: ConnectionState,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CallEvent);
}

/// Forwards events into an unbounded channel; events are dropped once the
/// receiver goes away.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }
}
