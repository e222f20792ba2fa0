//! Call orchestration: join/leave, envelope dispatch, connection reports and
//! the reconnect policy. Everything here runs on the single call task
//! started by [`spawn_call`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::connection::{
    ConnectionEvent, ConnectionFactory, ConnectionReport, ConnectionState, IceConnectionState,
    LocalStream, MediaSource,
};
use crate::envelope::{Envelope, PeerId};
use crate::error::{CallError, TransportError};
use crate::events::{CallEvent, ChatMessage, EventSink};
use crate::negotiation::Negotiator;
use crate::registry::PeerRegistry;
use crate::session::{PeerPhase, SkipReason, Step};
use crate::transport::{ChannelEvent, LocalIdentity, SignalChannel};

const TARGET: &str = "huddle::call";
pub const CONVERSATION_ID: &str = "global";

/// Work items processed one at a time by the call task.
#[derive(Debug)]
pub enum CallCommand {
    Channel(ChannelEvent),
    Connection(ConnectionReport),
    Reconnect {
        peer: PeerId,
        ticket: u64,
    },
    Join {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Leave {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ConnectToExisting {
        peers: Vec<PeerId>,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SendTyping {
        is_typing: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    Shutdown,
}

/// Local participation in the call. Present only while active.
#[derive(Debug)]
pub struct CallSession {
    local_stream: LocalStream,
}

impl CallSession {
    pub fn local_stream(&self) -> &LocalStream {
        &self.local_stream
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer: PeerId,
    pub generation: u64,
    pub phase: PeerPhase,
    pub connection_state: ConnectionState,
    pub pending_candidates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub active: bool,
    pub peers: Vec<PeerSnapshot>,
    pub scheduled_reconnects: Vec<PeerId>,
}

/// Tracks scheduled reconnects. Each schedule gets a ticket; only the most
/// recent ticket for a peer may fire.
#[derive(Debug)]
pub struct ReconnectPolicy {
    delay: Duration,
    ice_failure_delay: Duration,
    max_attempts: Option<u32>,
    next_ticket: u64,
    scheduled: HashMap<PeerId, u64>,
    attempts: HashMap<PeerId, u32>,
}

impl ReconnectPolicy {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            delay: config.reconnect_delay,
            ice_failure_delay: config.ice_failure_delay,
            max_attempts: config.max_reconnect_attempts,
            next_ticket: 1,
            scheduled: HashMap::new(),
            attempts: HashMap::new(),
        }
    }

    /// Reserves a ticket, or `None` once the attempt budget is spent.
    pub fn schedule(&mut self, peer: &PeerId) -> Option<u64> {
        let attempts = self.attempts.entry(peer.clone()).or_insert(0);
        if self.max_attempts.is_some_and(|max| *attempts >= max) {
            return None;
        }
        *attempts += 1;
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.scheduled.insert(peer.clone(), ticket);
        Some(ticket)
    }

    /// Consumes the ticket when it is still the current one for `peer`.
    pub fn claim(&mut self, peer: &PeerId, ticket: u64) -> bool {
        if self.scheduled.get(peer) == Some(&ticket) {
            self.scheduled.remove(peer);
            true
        } else {
            false
        }
    }

    pub fn cancel(&mut self, peer: &PeerId) {
        self.scheduled.remove(peer);
        self.attempts.remove(peer);
    }

    pub fn reset_attempts(&mut self, peer: &PeerId) {
        self.attempts.remove(peer);
    }

    pub fn clear(&mut self) {
        self.scheduled.clear();
        self.attempts.clear();
    }

    pub fn attempts(&self, peer: &PeerId) -> u32 {
        self.attempts.get(peer).copied().unwrap_or(0)
    }

    pub fn scheduled(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.scheduled.keys().cloned().collect();
        peers.sort();
        peers
    }
}

pub struct CallService {
    identity: LocalIdentity,
    negotiator: Negotiator,
    media: Arc<dyn MediaSource>,
    sink: Arc<dyn EventSink>,
    queue: mpsc::UnboundedSender<CallCommand>,
    call: Option<CallSession>,
    reconnect: ReconnectPolicy,
}

impl CallService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: LocalIdentity,
        config: &CallConfig,
        channel: Arc<dyn SignalChannel>,
        factory: Arc<dyn ConnectionFactory>,
        media: Arc<dyn MediaSource>,
        sink: Arc<dyn EventSink>,
        queue: mpsc::UnboundedSender<CallCommand>,
    ) -> Self {
        let negotiator = Negotiator::new(
            identity.id.clone(),
            PeerRegistry::new(config.max_parked_candidates),
            factory,
            channel,
            Arc::clone(&sink),
            queue.clone(),
        );
        Self {
            identity,
            negotiator,
            media,
            sink,
            queue,
            call: None,
            reconnect: ReconnectPolicy::new(config),
        }
    }

    pub fn is_active(&self) -> bool {
        self.call.is_some()
    }

    pub fn self_id(&self) -> &PeerId {
        &self.identity.id
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn negotiator_mut(&mut self) -> &mut Negotiator {
        &mut self.negotiator
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    fn local_stream(&self) -> Option<LocalStream> {
        self.call.as_ref().map(|call| call.local_stream.clone())
    }

    /// Acquires local media and announces the join. Fails without side
    /// effects when the channel is down or media is unavailable.
    pub async fn join(&mut self) -> Result<(), CallError> {
        if self.is_active() {
            return Err(CallError::AlreadyInCall);
        }
        if !self.negotiator.channel().is_open() {
            return Err(TransportError::NotOpen.into());
        }
        let local_stream = self.media.acquire().await?;

        let envelope = Envelope::JoinCall {
            user_id: self.identity.id.clone(),
            username: self.identity.username.clone(),
        };
        if let Err(err) = self.negotiator.send(&envelope) {
            local_stream.stop_all();
            return Err(err.into());
        }
        tracing::info!(
            target = TARGET,
            tracks = local_stream.tracks().len(),
            "joined call"
        );
        self.call = Some(CallSession { local_stream });
        Ok(())
    }

    /// Offers to every listed identity other than self. Nothing is opened
    /// while the local call is inactive.
    pub async fn connect_to_existing(&mut self, peers: &[PeerId]) -> Vec<(PeerId, Step)> {
        let local = self.local_stream();
        if local.is_none() {
            tracing::debug!(target = TARGET, peers = peers.len(), "not in call; skipping existing peers");
        }
        let mut outcomes = Vec::with_capacity(peers.len());
        for peer in peers {
            if peer == self.self_id() {
                continue;
            }
            let step = match &local {
                Some(local) => self.open_and_offer(peer, Some(local)).await,
                None => Step::Skipped(SkipReason::NotInCall),
            };
            outcomes.push((peer.clone(), step));
        }
        outcomes
    }

    async fn open_and_offer(&mut self, peer: &PeerId, local: Option<&LocalStream>) -> Step {
        if let Err(err) = self.negotiator.ensure_session(peer, local).await {
            tracing::warn!(target = TARGET, peer = %peer, error = %err, "failed to open connection");
            return Step::Failed;
        }
        self.negotiator.initiate_offer(peer).await
    }

    pub async fn dispatch(&mut self, envelope: Envelope) -> Step {
        if let Some(target) = envelope.target() {
            if target != self.self_id() {
                tracing::trace!(
                    target = TARGET,
                    kind = envelope.kind(),
                    to = %target,
                    "ignoring envelope for another participant"
                );
                return Step::Skipped(SkipReason::NotTargeted);
            }
        }

        match envelope {
            Envelope::Join { user_id, username } | Envelope::UserJoin { user_id, username } => {
                if user_id == self.identity.id {
                    return Step::Skipped(SkipReason::OwnEnvelope);
                }
                self.sink.emit(CallEvent::UserOnline {
                    peer: user_id,
                    username,
                });
                Step::Applied
            }
            Envelope::UsersSnapshot { users } => {
                self.sink.emit(CallEvent::UsersUpdated { users });
                Step::Applied
            }
            Envelope::Message {
                user_id,
                username,
                text,
                timestamp,
                id,
            } => {
                self.sink.emit(CallEvent::ChatMessage(ChatMessage {
                    id: id.unwrap_or_else(now_millis),
                    sender: user_id,
                    sender_username: username,
                    content: text,
                    created_at: timestamp.unwrap_or_else(now_rfc3339),
                }));
                Step::Applied
            }
            Envelope::History { messages } => {
                let history = messages.into_iter().filter_map(chat_from_value).collect();
                self.sink.emit(CallEvent::ChatHistory(history));
                Step::Applied
            }
            Envelope::Typing {
                user_id, is_typing, ..
            } => {
                if user_id == self.identity.id {
                    return Step::Skipped(SkipReason::OwnEnvelope);
                }
                self.sink.emit(CallEvent::TypingChanged {
                    peer: user_id,
                    is_typing,
                    conversation: CONVERSATION_ID.to_string(),
                });
                Step::Applied
            }
            Envelope::JoinCall { user_id, .. } => self.on_join_call(user_id).await,
            Envelope::LeaveCall { user_id } | Envelope::UserLeft { user_id } => {
                if user_id == self.identity.id {
                    return Step::Skipped(SkipReason::OwnEnvelope);
                }
                self.reconnect.cancel(&user_id);
                if self.negotiator.teardown(&user_id).await {
                    Step::Applied
                } else {
                    Step::Skipped(SkipReason::UnknownPeer)
                }
            }
            Envelope::Offer { user_id, sdp, .. } => {
                if user_id == self.identity.id {
                    return Step::Skipped(SkipReason::OwnEnvelope);
                }
                let local = self.local_stream();
                self.negotiator.accept_offer(&user_id, sdp, local.as_ref()).await
            }
            Envelope::Answer { user_id, sdp, .. } => {
                self.negotiator.accept_answer(&user_id, sdp).await
            }
            Envelope::IceCandidate {
                user_id, candidate, ..
            } => self.negotiator.add_remote_candidate(&user_id, candidate).await,
        }
    }

    async fn on_join_call(&mut self, peer: PeerId) -> Step {
        if peer == self.identity.id {
            return Step::Skipped(SkipReason::OwnEnvelope);
        }
        self.sink.emit(CallEvent::ParticipantJoined { peer: peer.clone() });
        if !self.is_active() {
            return Step::Skipped(SkipReason::NotInCall);
        }
        tracing::info!(target = TARGET, peer = %peer, "participant joined; offering");
        let local = self.local_stream();
        self.open_and_offer(&peer, local.as_ref()).await
    }

    pub async fn on_connection_report(&mut self, report: ConnectionReport) {
        let ConnectionReport {
            peer,
            generation,
            event,
        } = report;
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                self.negotiator.send_local_candidate(&peer, generation, candidate);
            }
            ConnectionEvent::Track(track) => {
                self.negotiator.record_track(&peer, generation, track);
            }
            ConnectionEvent::StateChanged(state) => {
                if !self.negotiator.record_connection_state(&peer, generation, state) {
                    tracing::trace!(target = TARGET, peer = %peer, generation, ?state, "stale state report");
                    return;
                }
                self.on_connection_state(peer, state).await;
            }
            ConnectionEvent::IceStateChanged(state) => {
                if !self.negotiator.is_live(&peer, generation) {
                    return;
                }
                tracing::debug!(target = TARGET, peer = %peer, ?state, "ice state changed");
                if state == IceConnectionState::Failed {
                    self.on_ice_failed(peer).await;
                }
            }
        }
    }

    async fn on_connection_state(&mut self, peer: PeerId, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                tracing::info!(target = TARGET, peer = %peer, "peer connected");
                self.reconnect.reset_attempts(&peer);
            }
            ConnectionState::Disconnected => {
                tracing::warn!(target = TARGET, peer = %peer, "peer disconnected");
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                tracing::warn!(target = TARGET, peer = %peer, ?state, "peer connection lost");
                self.negotiator.teardown(&peer).await;
                if self.is_active() {
                    let delay = self.reconnect.delay;
                    self.schedule_reconnect(peer, delay);
                }
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    async fn on_ice_failed(&mut self, peer: PeerId) {
        if !self.is_active() {
            tracing::warn!(target = TARGET, peer = %peer, "ice failed outside a call");
            return;
        }
        tracing::warn!(target = TARGET, peer = %peer, "ice failed; restarting");
        if self.negotiator.restart_ice(&peer).await.is_applied() {
            return;
        }
        self.negotiator.teardown(&peer).await;
        let delay = self.reconnect.ice_failure_delay;
        self.schedule_reconnect(peer, delay);
    }

    fn schedule_reconnect(&mut self, peer: PeerId, delay: Duration) {
        let Some(ticket) = self.reconnect.schedule(&peer) else {
            tracing::warn!(
                target = TARGET,
                peer = %peer,
                attempts = self.reconnect.attempts(&peer),
                "reconnect attempts exhausted"
            );
            return;
        };
        tracing::debug!(target = TARGET, peer = %peer, ticket, ?delay, "reconnect scheduled");
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.send(CallCommand::Reconnect { peer, ticket });
        });
    }

    pub async fn on_reconnect(&mut self, peer: PeerId, ticket: u64) -> Step {
        if !self.reconnect.claim(&peer, ticket) {
            tracing::trace!(target = TARGET, peer = %peer, ticket, "superseded reconnect");
            return Step::Skipped(SkipReason::UnknownPeer);
        }
        if !self.is_active() {
            return Step::Skipped(SkipReason::NotInCall);
        }
        if self.negotiator.registry().contains(&peer) {
            tracing::debug!(target = TARGET, peer = %peer, "session already re-established");
            return Step::Skipped(SkipReason::OfferWhileNegotiating);
        }
        tracing::info!(target = TARGET, peer = %peer, "reconnecting");
        let local = self.local_stream();
        self.open_and_offer(&peer, local.as_ref()).await
    }

    pub async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Envelope(envelope) => {
                let kind = envelope.kind();
                let step = self.dispatch(envelope).await;
                tracing::trace!(target = TARGET, kind, ?step, "dispatched");
            }
            ChannelEvent::Opened => {
                tracing::info!(target = TARGET, "signaling channel open");
            }
            ChannelEvent::Closed => {
                tracing::warn!(target = TARGET, "signaling channel closed");
                if self.is_active() {
                    self.end_call().await;
                }
            }
        }
    }

    /// Drops every session and the local stream without telling the room.
    async fn end_call(&mut self) {
        self.reconnect.clear();
        let closed = self.negotiator.teardown_all().await;
        if let Some(call) = self.call.take() {
            call.local_stream.stop_all();
        }
        tracing::info!(target = TARGET, sessions = closed, "call ended");
    }

    /// Ends the call locally and announces `leave-call`. Local state is
    /// cleared even when the announcement cannot be sent.
    pub async fn leave(&mut self) -> Result<(), CallError> {
        self.end_call().await;
        self.negotiator
            .send(&Envelope::LeaveCall {
                user_id: self.identity.id.clone(),
            })
            .map_err(CallError::from)
    }

    pub fn send_chat_message(&self, text: &str) -> Result<(), CallError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.negotiator.send(&Envelope::Message {
            user_id: self.identity.id.clone(),
            username: self.identity.username.clone(),
            text: text.to_string(),
            timestamp: Some(now_rfc3339()),
            id: None,
        })?;
        Ok(())
    }

    pub fn send_typing(&self, is_typing: bool) -> Result<(), CallError> {
        self.negotiator.send(&Envelope::Typing {
            user_id: self.identity.id.clone(),
            username: Some(self.identity.username.clone()),
            is_typing,
        })?;
        Ok(())
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let mut peers: Vec<_> = self
            .negotiator
            .registry()
            .sessions()
            .map(|session| PeerSnapshot {
                peer: session.identity().clone(),
                generation: session.generation(),
                phase: session.phase(),
                connection_state: session.connection_state(),
                pending_candidates: session.pending_len(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        CallSnapshot {
            active: self.is_active(),
            peers,
            scheduled_reconnects: self.reconnect.scheduled(),
        }
    }

    /// Processes one command. Returns false once the task should stop.
    pub async fn handle(&mut self, command: CallCommand) -> bool {
        match command {
            CallCommand::Channel(event) => self.on_channel_event(event).await,
            CallCommand::Connection(report) => self.on_connection_report(report).await,
            CallCommand::Reconnect { peer, ticket } => {
                self.on_reconnect(peer, ticket).await;
            }
            CallCommand::Join { reply } => {
                let _ = reply.send(self.join().await);
            }
            CallCommand::Leave { reply } => {
                let _ = reply.send(self.leave().await);
            }
            CallCommand::ConnectToExisting { peers } => {
                self.connect_to_existing(&peers).await;
            }
            CallCommand::SendChat { text, reply } => {
                let _ = reply.send(self.send_chat_message(&text));
            }
            CallCommand::SendTyping { is_typing, reply } => {
                let _ = reply.send(self.send_typing(is_typing));
            }
            CallCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            CallCommand::Shutdown => {
                if self.is_active() {
                    if let Err(err) = self.leave().await {
                        tracing::debug!(target = TARGET, error = %err, "leave on shutdown failed");
                    }
                }
                return false;
            }
        }
        true
    }
}

/// Handle to a running call task. Dropping it stops the task, leaving the
/// call first when active.
pub struct CallHandle {
    queue: mpsc::UnboundedSender<CallCommand>,
    task: Option<JoinHandle<()>>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_call(
    identity: LocalIdentity,
    config: &CallConfig,
    channel: Arc<dyn SignalChannel>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    factory: Arc<dyn ConnectionFactory>,
    media: Arc<dyn MediaSource>,
    sink: Arc<dyn EventSink>,
) -> CallHandle {
    let (queue, commands) = mpsc::unbounded_channel();
    let service = CallService::new(
        identity,
        config,
        channel,
        factory,
        media,
        sink,
        queue.clone(),
    );
    let task = tokio::spawn(run(service, commands, channel_events));
    CallHandle {
        queue,
        task: Some(task),
    }
}

async fn run(
    mut service: CallService,
    mut commands: mpsc::UnboundedReceiver<CallCommand>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    let mut channel_live = true;
    loop {
        let command = tokio::select! {
            event = channel_events.recv(), if channel_live => match event {
                Some(event) => CallCommand::Channel(event),
                None => {
                    channel_live = false;
                    continue;
                }
            },
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        if !service.handle(command).await {
            break;
        }
    }
    tracing::debug!(target = TARGET, "call task stopped");
}

impl CallHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(build(reply))
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)
    }

    pub async fn join(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Join { reply }).await?
    }

    pub async fn leave(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Leave { reply }).await?
    }

    pub fn connect_to_existing(&self, peers: Vec<PeerId>) -> Result<(), CallError> {
        self.queue
            .send(CallCommand::ConnectToExisting { peers })
            .map_err(|_| CallError::Stopped)
    }

    pub async fn send_chat_message(&self, text: impl Into<String>) -> Result<(), CallError> {
        let text = text.into();
        self.request(|reply| CallCommand::SendChat { text, reply })
            .await?
    }

    pub async fn send_typing(&self, is_typing: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SendTyping { is_typing, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| CallCommand::Snapshot { reply }).await
    }

    /// Stops the task and waits for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.queue.send(CallCommand::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(target = TARGET, error = %err, "call task panicked");
            }
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.queue.send(CallCommand::Shutdown);
        }
    }
}

fn now_millis() -> Value {
    Value::from(Utc::now().timestamp_millis())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Normalizes a stored chat message the way live `message` envelopes are.
fn chat_from_value(value: Value) -> Option<ChatMessage> {
    let sender = value.get("userId").or_else(|| value.get("sender"))?;
    let sender = match sender {
        Value::String(text) => PeerId::new(text.clone()),
        Value::Number(number) => PeerId::new(number.to_string()),
        _ => return None,
    };
    let text_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    };
    Some(ChatMessage {
        id: value
            .get("id")
            .filter(|id| !id.is_null())
            .cloned()
            .unwrap_or_else(now_millis),
        sender_username: text_field(&["username", "sender_username"]).unwrap_or_default(),
        content: text_field(&["text", "content"])?,
        created_at: text_field(&["timestamp", "created_at"]).unwrap_or_else(now_rfc3339),
        sender,
    })
}
