//! Offer/answer/candidate operations over the peer registry.
//!
//! Every operation runs on the call task. Precondition violations come back
//! as [`Step::Skipped`]; connection failures are logged and come back as
//! [`Step::Failed`]. Nothing here is fatal to the call.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::call::CallCommand;
use crate::connection::{
    ConnectionEvents, ConnectionFactory, ConnectionState, LocalStream, NegotiableConnection,
    OfferOptions, RemoteTrack,
};
use crate::envelope::{Envelope, IceCandidate, PeerId, SessionDescription};
use crate::error::{ConnectionError, TransportError};
use crate::events::{CallEvent, EventSink};
use crate::registry::PeerRegistry;
use crate::session::{PeerSession, SkipReason, Step};
use crate::transport::SignalChannel;

const TARGET: &str = "huddle::negotiation";

pub struct Negotiator {
    self_id: PeerId,
    registry: PeerRegistry,
    factory: Arc<dyn ConnectionFactory>,
    channel: Arc<dyn SignalChannel>,
    sink: Arc<dyn EventSink>,
    queue: mpsc::UnboundedSender<CallCommand>,
    offer_options: OfferOptions,
}

impl Negotiator {
    pub fn new(
        self_id: PeerId,
        registry: PeerRegistry,
        factory: Arc<dyn ConnectionFactory>,
        channel: Arc<dyn SignalChannel>,
        sink: Arc<dyn EventSink>,
        queue: mpsc::UnboundedSender<CallCommand>,
    ) -> Self {
        Self {
            self_id,
            registry,
            factory,
            channel,
            sink,
            queue,
            offer_options: OfferOptions::default(),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn channel(&self) -> &Arc<dyn SignalChannel> {
        &self.channel
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.channel.send(envelope)
    }

    /// Returns the live session generation for `identity`, creating the
    /// session (and its connection) when none exists.
    pub async fn ensure_session(
        &mut self,
        identity: &PeerId,
        local: Option<&LocalStream>,
    ) -> Result<u64, ConnectionError> {
        if let Some(session) = self.registry.get(identity) {
            if !session.is_closed() {
                return Ok(session.generation());
            }
            self.registry.remove(identity);
        }

        let generation = self.registry.next_generation();
        let events = ConnectionEvents::new(identity.clone(), generation, self.queue.clone());
        let connection = self.factory.open(identity, events).await?;
        if let Some(local) = local {
            attach_local_tracks(identity, connection.as_ref(), local).await;
        }

        let session = self
            .registry
            .insert(PeerSession::new(identity.clone(), generation, connection));
        tracing::debug!(
            target = TARGET,
            peer = %identity,
            generation,
            pending = session.pending_len(),
            "peer session created"
        );
        Ok(generation)
    }

    pub async fn initiate_offer(&mut self, identity: &PeerId) -> Step {
        self.offer_with(identity, self.offer_options).await
    }

    /// Re-offers with fresh ICE credentials.
    pub async fn restart_ice(&mut self, identity: &PeerId) -> Step {
        self.offer_with(identity, OfferOptions::ice_restart()).await
    }

    async fn offer_with(&mut self, identity: &PeerId, options: OfferOptions) -> Step {
        let Some(session) = self.registry.get(identity) else {
            return skip(identity, "offer", SkipReason::UnknownPeer);
        };
        if let Err(reason) = session.check_can_offer() {
            return skip(identity, "offer", reason);
        }
        let connection = Arc::clone(session.connection());

        let offer = match connection.create_offer(options).await {
            Ok(offer) => offer,
            Err(err) => return failed(identity, "create offer", &err),
        };
        if let Err(err) = connection.set_local_description(offer.clone()).await {
            return failed(identity, "set local offer", &err);
        }
        self.refresh(identity);

        let envelope = Envelope::Offer {
            user_id: self.self_id.clone(),
            target_user_id: identity.clone(),
            sdp: offer,
        };
        if let Err(err) = self.channel.send(&envelope) {
            tracing::warn!(target = TARGET, peer = %identity, error = %err, "offer not sent");
            return Step::Failed;
        }
        tracing::debug!(
            target = TARGET,
            peer = %identity,
            ice_restart = options.ice_restart,
            "offer sent"
        );
        Step::Applied
    }

    pub async fn accept_offer(
        &mut self,
        identity: &PeerId,
        description: SessionDescription,
        local: Option<&LocalStream>,
    ) -> Step {
        self.revive(identity);
        if let Err(err) = self.ensure_session(identity, None).await {
            return failed(identity, "open connection", &err);
        }
        let Some(session) = self.registry.get(identity) else {
            return skip(identity, "offer", SkipReason::UnknownPeer);
        };
        let connection = Arc::clone(session.connection());

        if let Err(err) = connection.set_remote_description(description).await {
            return failed(identity, "set remote offer", &err);
        }
        self.refresh(identity);

        if let Some(local) = local {
            attach_local_tracks(identity, connection.as_ref(), local).await;
        }

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return failed(identity, "create answer", &err),
        };
        if let Err(err) = connection.set_local_description(answer.clone()).await {
            return failed(identity, "set local answer", &err);
        }
        if let Some(session) = self.registry.get_mut(identity) {
            session.mark_negotiated();
        }

        let envelope = Envelope::Answer {
            user_id: self.self_id.clone(),
            target_user_id: identity.clone(),
            sdp: answer,
        };
        if let Err(err) = self.channel.send(&envelope) {
            tracing::warn!(target = TARGET, peer = %identity, error = %err, "answer not sent");
        }

        self.drain_pending(identity).await;
        Step::Applied
    }

    pub async fn accept_answer(&mut self, identity: &PeerId, description: SessionDescription) -> Step {
        let Some(session) = self.registry.get(identity) else {
            return skip(identity, "answer", SkipReason::UnknownPeer);
        };
        if let Err(reason) = session.check_can_accept_answer() {
            return skip(identity, "answer", reason);
        }
        let connection = Arc::clone(session.connection());
        self.revive(identity);

        if let Err(err) = connection.set_remote_description(description).await {
            return failed(identity, "set remote answer", &err);
        }
        if let Some(session) = self.registry.get_mut(identity) {
            session.mark_negotiated();
        }
        self.drain_pending(identity).await;
        Step::Applied
    }

    pub async fn add_remote_candidate(&mut self, identity: &PeerId, candidate: IceCandidate) -> Step {
        if self.registry.is_retired(identity) {
            return skip(identity, "candidate", SkipReason::SessionClosed);
        }
        let Some(session) = self.registry.get_mut(identity) else {
            self.registry.park_candidate(identity, candidate);
            tracing::debug!(target = TARGET, peer = %identity, "candidate parked until session exists");
            return Step::Queued;
        };
        if session.is_closed() {
            return skip(identity, "candidate", SkipReason::SessionClosed);
        }
        let connection = Arc::clone(session.connection());

        if !connection.has_remote_description().await {
            if let Some(session) = self.registry.get_mut(identity) {
                session.queue_candidate(candidate);
            }
            tracing::trace!(target = TARGET, peer = %identity, "candidate queued");
            return Step::Queued;
        }

        match connection.add_ice_candidate(candidate.clone()).await {
            Ok(()) => Step::Applied,
            Err(err) => {
                tracing::warn!(
                    target = TARGET,
                    peer = %identity,
                    error = %err,
                    "candidate rejected; requeued"
                );
                if let Some(session) = self.registry.get_mut(identity) {
                    session.queue_candidate(candidate);
                }
                Step::Queued
            }
        }
    }

    /// Applies queued candidates in arrival order. Failures are dropped.
    async fn drain_pending(&mut self, identity: &PeerId) -> usize {
        let Some(session) = self.registry.get_mut(identity) else {
            return 0;
        };
        let pending = session.take_pending();
        if pending.is_empty() {
            return 0;
        }
        let connection = Arc::clone(session.connection());

        let mut applied = 0;
        for candidate in pending {
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    tracing::warn!(
                        target = TARGET,
                        peer = %identity,
                        error = %err,
                        "dropping queued candidate"
                    );
                }
            }
        }
        tracing::debug!(target = TARGET, peer = %identity, applied, "drained queued candidates");
        applied
    }

    /// Closes and forgets the session. Returns false (and emits nothing)
    /// when no session existed.
    pub async fn teardown(&mut self, identity: &PeerId) -> bool {
        let Some(session) = self.registry.remove(identity) else {
            return false;
        };
        self.registry.retire(identity);
        self.close_session(session).await;
        true
    }

    pub async fn teardown_all(&mut self) -> usize {
        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            self.registry.retire(session.identity());
            self.close_session(session).await;
        }
        count
    }

    async fn close_session(&self, mut session: PeerSession) {
        session.mark_closed();
        let identity = session.identity().clone();
        if let Err(err) = session.connection().close().await {
            tracing::debug!(target = TARGET, peer = %identity, error = %err, "close failed");
        }
        tracing::info!(
            target = TARGET,
            peer = %identity,
            generation = session.generation(),
            "peer session closed"
        );
        if session.remote_stream().is_some() {
            self.sink.emit(CallEvent::RemoteStreamRemoved {
                peer: identity.clone(),
            });
        }
        self.sink.emit(CallEvent::ParticipantLeft { peer: identity });
    }

    /// The session for `identity` when it is still the one that produced
    /// `generation`.
    pub fn live_session(&mut self, identity: &PeerId, generation: u64) -> Option<&mut PeerSession> {
        self.registry
            .get_mut(identity)
            .filter(|session| session.generation() == generation && !session.is_closed())
    }

    pub fn is_live(&self, identity: &PeerId, generation: u64) -> bool {
        self.registry
            .get(identity)
            .is_some_and(|session| session.generation() == generation && !session.is_closed())
    }

    pub fn send_local_candidate(&mut self, identity: &PeerId, generation: u64, candidate: IceCandidate) {
        if !self.is_live(identity, generation) {
            return;
        }
        let envelope = Envelope::IceCandidate {
            user_id: self.self_id.clone(),
            target_user_id: identity.clone(),
            candidate,
        };
        if let Err(err) = self.channel.send(&envelope) {
            tracing::warn!(target = TARGET, peer = %identity, error = %err, "local candidate not sent");
        }
    }

    pub fn record_track(&mut self, identity: &PeerId, generation: u64, track: RemoteTrack) {
        let Some(session) = self.live_session(identity, generation) else {
            return;
        };
        let (stream, created) = session.remote_stream_or_insert();
        let track_id = track.id.clone();
        if !stream.add_track(track) {
            tracing::trace!(target = TARGET, peer = %identity, track = %track_id, "duplicate remote track");
        }
        if created {
            self.sink.emit(CallEvent::RemoteStreamAdded {
                peer: identity.clone(),
                stream,
            });
        }
    }

    /// Returns false when the report belongs to a stale session.
    pub fn record_connection_state(
        &mut self,
        identity: &PeerId,
        generation: u64,
        state: ConnectionState,
    ) -> bool {
        let Some(session) = self.live_session(identity, generation) else {
            return false;
        };
        session.set_connection_state(state);
        self.sink.emit(CallEvent::PeerConnectionState {
            peer: identity.clone(),
            state,
        });
        true
    }

    fn revive(&mut self, identity: &PeerId) {
        if self.registry.revive(identity) {
            tracing::debug!(target = TARGET, peer = %identity, "fresh description; accepting candidates again");
        }
    }

    fn refresh(&mut self, identity: &PeerId) {
        if let Some(session) = self.registry.get_mut(identity) {
            session.refresh_phase();
        }
    }
}

/// Adds every local track the connection is not already sending.
async fn attach_local_tracks(identity: &PeerId, connection: &dyn NegotiableConnection, local: &LocalStream) {
    let attached = connection.sender_track_ids().await;
    for track in local.tracks() {
        if attached.iter().any(|id| id == track.id()) {
            continue;
        }
        if let Err(err) = connection.add_track(Arc::clone(track)).await {
            tracing::warn!(
                target = TARGET,
                peer = %identity,
                track = track.id(),
                error = %err,
                "failed to attach local track"
            );
        }
    }
}

fn skip(identity: &PeerId, op: &'static str, reason: SkipReason) -> Step {
    match reason {
        SkipReason::DuplicateAnswer
        | SkipReason::OfferWhileNegotiating
        | SkipReason::SessionClosed => {
            tracing::debug!(target = TARGET, peer = %identity, op, %reason, "skipped");
        }
        _ => {
            tracing::warn!(target = TARGET, peer = %identity, op, %reason, "skipped");
        }
    }
    Step::Skipped(reason)
}

fn failed(identity: &PeerId, op: &'static str, err: &ConnectionError) -> Step {
    tracing::warn!(target = TARGET, peer = %identity, op, error = %err, "negotiation step failed");
    Step::Failed
}
