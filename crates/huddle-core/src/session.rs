//! Per-identity negotiation record and its explicit phase.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::connection::{ConnectionState, NegotiableConnection, RemoteStream, SignalingState};
use crate::envelope::{IceCandidate, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationSide {
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Created, no description exchanged yet.
    Idle,
    Negotiating(NegotiationSide),
    Stable,
    /// Terminal. A closed session is never reused.
    Closed,
}

impl PeerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerPhase::Idle => "idle",
            PeerPhase::Negotiating(NegotiationSide::HaveLocalOffer) => "have-local-offer",
            PeerPhase::Negotiating(NegotiationSide::HaveRemoteOffer) => "have-remote-offer",
            PeerPhase::Stable => "stable",
            PeerPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named, non-fatal reasons an operation was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OfferWhileNegotiating,
    DuplicateAnswer,
    UnexpectedAnswer,
    UnknownPeer,
    NotTargeted,
    OwnEnvelope,
    NotInCall,
    SessionClosed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::OfferWhileNegotiating => "offer while negotiating",
            SkipReason::DuplicateAnswer => "duplicate answer",
            SkipReason::UnexpectedAnswer => "unexpected answer",
            SkipReason::UnknownPeer => "unknown peer",
            SkipReason::NotTargeted => "not targeted at self",
            SkipReason::OwnEnvelope => "own envelope",
            SkipReason::NotInCall => "not in call",
            SkipReason::SessionClosed => "session closed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one negotiation or dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Applied,
    /// Candidate stored for later application.
    Queued,
    Skipped(SkipReason),
    /// The connection capability rejected the step; already logged.
    Failed,
}

impl Step {
    pub fn is_applied(self) -> bool {
        matches!(self, Step::Applied)
    }
}

pub struct PeerSession {
    identity: PeerId,
    generation: u64,
    connection: Arc<dyn NegotiableConnection>,
    phase: PeerPhase,
    pending_remote_candidates: VecDeque<IceCandidate>,
    remote_stream: Option<Arc<RemoteStream>>,
    connection_state: ConnectionState,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .field("phase", &self.phase)
            .field("pending", &self.pending_remote_candidates.len())
            .field("connection_state", &self.connection_state)
            .finish()
    }
}

impl PeerSession {
    pub fn new(identity: PeerId, generation: u64, connection: Arc<dyn NegotiableConnection>) -> Self {
        Self {
            identity,
            generation,
            connection,
            phase: PeerPhase::Idle,
            pending_remote_candidates: VecDeque::new(),
            remote_stream: None,
            connection_state: ConnectionState::New,
        }
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> &Arc<dyn NegotiableConnection> {
        &self.connection
    }

    pub fn phase(&self) -> PeerPhase {
        self.phase
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub fn remote_stream(&self) -> Option<&Arc<RemoteStream>> {
        self.remote_stream.as_ref()
    }

    /// Returns the remote stream and whether it was created by this call.
    pub fn remote_stream_or_insert(&mut self) -> (Arc<RemoteStream>, bool) {
        match &self.remote_stream {
            Some(stream) => (Arc::clone(stream), false),
            None => {
                let stream = Arc::new(RemoteStream::new(self.identity.clone()));
                self.remote_stream = Some(Arc::clone(&stream));
                (stream, true)
            }
        }
    }

    /// Re-derives the phase from the connection's signaling state after a
    /// negotiation step.
    pub fn refresh_phase(&mut self) -> PeerPhase {
        if self.phase == PeerPhase::Closed {
            return self.phase;
        }
        self.phase = match self.connection.signaling_state() {
            SignalingState::HaveLocalOffer | SignalingState::HaveLocalPranswer => {
                PeerPhase::Negotiating(NegotiationSide::HaveLocalOffer)
            }
            SignalingState::HaveRemoteOffer | SignalingState::HaveRemotePranswer => {
                PeerPhase::Negotiating(NegotiationSide::HaveRemoteOffer)
            }
            SignalingState::Stable if self.phase == PeerPhase::Idle => PeerPhase::Idle,
            SignalingState::Stable => PeerPhase::Stable,
            SignalingState::Closed => PeerPhase::Closed,
        };
        self.phase
    }

    /// Marks the end of a completed offer/answer exchange.
    pub fn mark_negotiated(&mut self) {
        if self.phase != PeerPhase::Closed
            && self.connection.signaling_state() == SignalingState::Stable
        {
            self.phase = PeerPhase::Stable;
        } else {
            self.refresh_phase();
        }
    }

    pub fn mark_closed(&mut self) {
        self.phase = PeerPhase::Closed;
        self.pending_remote_candidates.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.phase == PeerPhase::Closed
    }

    /// An offer may only be produced from signaling state `stable`.
    pub fn check_can_offer(&self) -> Result<(), SkipReason> {
        if self.is_closed() {
            return Err(SkipReason::SessionClosed);
        }
        match self.connection.signaling_state() {
            SignalingState::Stable => Ok(()),
            SignalingState::Closed => Err(SkipReason::SessionClosed),
            _ => Err(SkipReason::OfferWhileNegotiating),
        }
    }

    /// An answer is only accepted in `have-local-offer`; in `stable` it is a
    /// stale duplicate.
    pub fn check_can_accept_answer(&self) -> Result<(), SkipReason> {
        if self.is_closed() {
            return Err(SkipReason::SessionClosed);
        }
        match self.connection.signaling_state() {
            SignalingState::HaveLocalOffer => Ok(()),
            SignalingState::Stable => Err(SkipReason::DuplicateAnswer),
            SignalingState::Closed => Err(SkipReason::SessionClosed),
            _ => Err(SkipReason::UnexpectedAnswer),
        }
    }

    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.pending_remote_candidates.push_back(candidate);
    }

    pub fn adopt_candidates(&mut self, candidates: impl IntoIterator<Item = IceCandidate>) {
        self.pending_remote_candidates.extend(candidates);
    }

    pub fn take_pending(&mut self) -> VecDeque<IceCandidate> {
        std::mem::take(&mut self.pending_remote_candidates)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &IceCandidate> {
        self.pending_remote_candidates.iter()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::connection::{
        ConnectionState, MediaTrack, NegotiableConnection, OfferOptions, SignalingState,
    };
    use crate::envelope::{IceCandidate, SessionDescription};
    use crate::error::ConnectionError;

    /// Connection whose signaling state is set directly by the test.
    #[derive(Debug)]
    pub struct StubConnection {
        pub state: Mutex<SignalingState>,
    }

    impl StubConnection {
        pub fn with_state(state: SignalingState) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
            })
        }
    }

    #[async_trait]
    impl NegotiableConnection for StubConnection {
        async fn create_offer(
            &self,
            _options: OfferOptions,
        ) -> Result<SessionDescription, ConnectionError> {
            Ok(SessionDescription::offer("stub"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
            Ok(SessionDescription::answer("stub"))
        }
        async fn set_local_description(
            &self,
            _description: SessionDescription,
        ) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn set_remote_description(
            &self,
            _description: SessionDescription,
        ) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn add_track(&self, _track: Arc<dyn MediaTrack>) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn sender_track_ids(&self) -> Vec<String> {
            Vec::new()
        }
        async fn has_remote_description(&self) -> bool {
            false
        }
        fn signaling_state(&self) -> SignalingState {
            *self.state.lock()
        }
        fn connection_state(&self) -> ConnectionState {
            ConnectionState::New
        }
        async fn close(&self) -> Result<(), ConnectionError> {
            *self.state.lock() = SignalingState::Closed;
            Ok(())
        }
    }
}
