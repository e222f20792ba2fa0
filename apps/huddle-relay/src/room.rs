//! The single global room every socket joins.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use huddle_core::envelope::{self, Envelope};
use huddle_core::PeerId;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

const TARGET: &str = "huddle::relay::room";

/// Chat messages replayed to each new socket.
pub const HISTORY_LIMIT: usize = 50;

pub type SocketId = u64;

#[derive(Debug, Clone)]
struct Identity {
    user_id: PeerId,
    username: String,
}

struct Member {
    tx: mpsc::UnboundedSender<String>,
    identity: Option<Identity>,
}

#[derive(Clone, Default)]
pub struct Room {
    members: Arc<DashMap<SocketId, Member>>,
    next_socket: Arc<AtomicU64>,
    /// In memory only; lost when the relay stops.
    history: Arc<Mutex<VecDeque<Value>>>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket. Frames for it arrive on the returned receiver,
    /// starting with a `history` replay when any chat has been relayed.
    pub fn connect(&self) -> (SocketId, mpsc::UnboundedReceiver<String>) {
        let socket = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        // Held across insert so a concurrent chat lands either in the
        // replay or in the live stream, never both.
        let history = self.history.lock();
        if !history.is_empty() {
            let replay = Envelope::History {
                messages: history.iter().cloned().collect(),
            };
            match envelope::encode(&replay) {
                Ok(text) => {
                    let _ = tx.send(text);
                }
                Err(err) => {
                    tracing::error!(target = TARGET, socket, error = %err, "failed to encode history")
                }
            }
        }
        self.members.insert(socket, Member { tx, identity: None });
        drop(history);

        tracing::debug!(target = TARGET, socket, members = self.members.len(), "socket connected");
        (socket, rx)
    }

    /// Removes a socket. A socket that had joined is announced as
    /// `user-left` together with a fresh users snapshot.
    pub fn disconnect(&self, socket: SocketId) -> Option<PeerId> {
        let (_, member) = self.members.remove(&socket)?;
        let identity = member.identity?;
        tracing::info!(target = TARGET, socket, user = %identity.user_id, "user left");
        self.broadcast_envelope(&Envelope::UserLeft {
            user_id: identity.user_id.clone(),
        });
        self.broadcast_users();
        Some(identity.user_id)
    }

    /// Routes one inbound text frame. Malformed frames are dropped.
    pub fn handle_frame(&self, socket: SocketId, text: &str) {
        let envelope = match envelope::decode(text) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::debug!(target = TARGET, socket, "dropping frame of unknown type");
                return;
            }
            Err(err) => {
                tracing::warn!(target = TARGET, socket, error = %err, "dropping malformed frame");
                return;
            }
        };

        match envelope {
            Envelope::Join { user_id, username } => self.join(socket, user_id, username),
            Envelope::Message { .. } => self.relay_chat(socket, text),
            Envelope::Typing { .. }
            | Envelope::JoinCall { .. }
            | Envelope::LeaveCall { .. }
            | Envelope::Offer { .. }
            | Envelope::Answer { .. }
            | Envelope::IceCandidate { .. } => {
                tracing::trace!(target = TARGET, socket, kind = envelope.kind(), "relaying");
                self.broadcast(text);
            }
            Envelope::UsersSnapshot { .. }
            | Envelope::UserLeft { .. }
            | Envelope::UserJoin { .. }
            | Envelope::History { .. } => {
                tracing::debug!(
                    target = TARGET,
                    socket,
                    kind = envelope.kind(),
                    "ignoring relay-originated kind sent by a client"
                );
            }
        }
    }

    fn relay_chat(&self, socket: SocketId, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(target = TARGET, socket, error = %err, "dropping malformed frame");
                return;
            }
        };
        let mut history = self.history.lock();
        if history.len() >= HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(frame);
        tracing::trace!(target = TARGET, socket, kept = history.len(), "relaying chat message");
        self.broadcast(text);
    }

    fn join(&self, socket: SocketId, user_id: PeerId, username: String) {
        {
            let Some(mut member) = self.members.get_mut(&socket) else {
                return;
            };
            member.identity = Some(Identity {
                user_id: user_id.clone(),
                username: username.clone(),
            });
        }
        tracing::info!(target = TARGET, socket, user = %user_id, username = %username, "user joined");
        self.broadcast_envelope(&Envelope::UserJoin { user_id, username });
        self.broadcast_users();
    }

    /// Joined identities, one entry per user id, ordered by id.
    pub fn users(&self) -> Vec<Value> {
        let mut users = BTreeMap::new();
        for member in self.members.iter() {
            if let Some(identity) = &member.identity {
                users.insert(identity.user_id.clone(), identity.username.clone());
            }
        }
        users
            .into_iter()
            .map(|(user_id, username)| json!({ "userId": user_id, "username": username }))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn broadcast_users(&self) {
        self.broadcast_envelope(&Envelope::UsersSnapshot {
            users: self.users(),
        });
    }

    fn broadcast_envelope(&self, envelope: &Envelope) {
        match envelope::encode(envelope) {
            Ok(text) => self.broadcast(&text),
            Err(err) => {
                tracing::error!(target = TARGET, kind = envelope.kind(), error = %err, "failed to encode")
            }
        }
    }

    /// Sends `text` to every socket, the sender included.
    fn broadcast(&self, text: &str) {
        for member in self.members.iter() {
            let _ = member.tx.send(text.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    fn types(frames: &[Value]) -> Vec<&str> {
        frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
    }

    #[test]
    fn join_announces_user_and_snapshot_to_everyone() {
        let room = Room::new();
        let (a, mut a_rx) = room.connect();
        let (_b, mut b_rx) = room.connect();

        room.handle_frame(a, r#"{"type":"join","userId":"1","username":"ann"}"#);

        for rx in [&mut a_rx, &mut b_rx] {
            let frames = drain(rx);
            assert_eq!(types(&frames), ["user-join", "users"]);
            assert_eq!(frames[0]["userId"], "1");
            assert_eq!(frames[1]["users"], json!([{ "userId": "1", "username": "ann" }]));
        }
    }

    #[test]
    fn signaling_is_relayed_verbatim_including_sender() {
        let room = Room::new();
        let (a, mut a_rx) = room.connect();
        let (_b, mut b_rx) = room.connect();
        let offer = r#"{"type":"offer","userId":"1","targetUserId":"2","sdp":{"type":"offer","sdp":"v=0"},"extra":true}"#;

        room.handle_frame(a, offer);

        assert_eq!(a_rx.try_recv().unwrap(), offer);
        assert_eq!(b_rx.try_recv().unwrap(), offer);
    }

    #[test]
    fn malformed_and_unknown_frames_are_dropped() {
        let room = Room::new();
        let (a, mut a_rx) = room.connect();

        room.handle_frame(a, "not json");
        room.handle_frame(a, r#"{"type":"offer","userId":"1"}"#);
        room.handle_frame(a, r#"{"type":"wave","userId":"1"}"#);
        room.handle_frame(a, r#"{"type":"user-left","userId":"9"}"#);

        assert!(drain(&mut a_rx).is_empty());
    }

    #[test]
    fn disconnect_announces_departure_for_joined_sockets() {
        let room = Room::new();
        let (a, _a_rx) = room.connect();
        let (b, mut b_rx) = room.connect();
        room.handle_frame(a, r#"{"type":"join","userId":7,"username":"ann"}"#);
        drain(&mut b_rx);

        assert_eq!(room.disconnect(a), Some(PeerId::from("7")));

        let frames = drain(&mut b_rx);
        assert_eq!(types(&frames), ["user-left", "users"]);
        assert_eq!(frames[0]["userId"], "7");
        assert_eq!(frames[1]["users"], json!([]));
        assert_eq!(room.len(), 1);

        assert_eq!(room.disconnect(b), None);
        assert!(room.is_empty());
    }

    #[test]
    fn new_sockets_receive_recent_chat_history() {
        let room = Room::new();
        let (quiet, mut quiet_rx) = room.connect();
        assert!(drain(&mut quiet_rx).is_empty());

        for n in 0..HISTORY_LIMIT + 2 {
            let frame = json!({ "type": "message", "userId": "1", "username": "ann", "text": format!("m{n}") });
            room.handle_frame(quiet, &frame.to_string());
        }
        room.handle_frame(quiet, r#"{"type":"typing","userId":"1","isTyping":true}"#);

        let (_late, mut late_rx) = room.connect();
        let frames = drain(&mut late_rx);
        assert_eq!(types(&frames), ["history"]);
        let messages = frames[0]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), HISTORY_LIMIT);
        assert_eq!(messages[0]["text"], "m2");
        assert_eq!(messages[HISTORY_LIMIT - 1]["text"], format!("m{}", HISTORY_LIMIT + 1));
        assert_eq!(messages[0]["username"], "ann");
    }

    #[test]
    fn empty_room_sends_no_history() {
        let room = Room::new();
        let (a, _a_rx) = room.connect();
        room.handle_frame(a, r#"{"type":"typing","userId":"1","isTyping":true}"#);
        let (_b, mut b_rx) = room.connect();
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn users_snapshot_has_one_entry_per_identity() {
        let room = Room::new();
        let (a, _a_rx) = room.connect();
        let (b, _b_rx) = room.connect();
        let (_c, _c_rx) = room.connect();
        room.handle_frame(a, r#"{"type":"join","userId":"2","username":"bo"}"#);
        room.handle_frame(b, r#"{"type":"join","userId":"2","username":"bo"}"#);

        assert_eq!(room.users(), vec![json!({ "userId": "2", "username": "bo" })]);
    }
}
