//! In-process relay with the same room semantics as the WebSocket relay:
//! every envelope reaches every attached channel, the sender included.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ChannelEvent, LocalIdentity, SignalChannel};
use crate::envelope::Envelope;
use crate::error::TransportError;

struct Member {
    id: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Clone, Default)]
pub struct LocalHub {
    members: Arc<Mutex<Vec<Member>>>,
    next_id: Arc<AtomicU64>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a channel and announces `identity` to the room.
    pub fn attach(
        &self,
        identity: LocalIdentity,
    ) -> (Arc<LocalChannel>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(ChannelEvent::Opened);
        self.members.lock().push(Member { id, events: tx });
        self.broadcast(&identity.join_envelope());
        let channel = Arc::new(LocalChannel {
            id,
            identity,
            hub: self.clone(),
            open: AtomicBool::new(true),
        });
        (channel, rx)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    fn broadcast(&self, envelope: &Envelope) {
        let mut members = self.members.lock();
        members.retain(|member| {
            member
                .events
                .send(ChannelEvent::Envelope(envelope.clone()))
                .is_ok()
        });
    }

    fn detach(&self, id: u64) -> Option<mpsc::UnboundedSender<ChannelEvent>> {
        let mut members = self.members.lock();
        let index = members.iter().position(|member| member.id == id)?;
        Some(members.remove(index).events)
    }
}

pub struct LocalChannel {
    id: u64,
    identity: LocalIdentity,
    hub: LocalHub,
    open: AtomicBool,
}

impl LocalChannel {
    /// Simulates the relay dropping this socket: the channel reports
    /// `Closed` and the room receives `user-left`.
    pub fn disconnect(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(events) = self.hub.detach(self.id) {
            let _ = events.send(ChannelEvent::Closed);
        }
        self.hub.broadcast(&Envelope::UserLeft {
            user_id: self.identity.id.clone(),
        });
    }
}

impl SignalChannel for LocalChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.hub.broadcast(envelope);
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
