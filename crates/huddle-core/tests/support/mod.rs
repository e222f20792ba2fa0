#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use huddle_core::{
    CallCommand, CallConfig, CallEvent, CallService, ConnectionError, ConnectionEvents,
    ConnectionFactory, ConnectionState, Envelope, EventSink, IceCandidate, LocalIdentity,
    LocalStream, MediaError, MediaSource, MediaTrack, NegotiableConnection, OfferOptions, PeerId,
    SdpType, SessionDescription, SignalChannel, SignalingState, TrackKind, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<String>,
    senders: Vec<String>,
    offer_options: Vec<OfferOptions>,
    remote_sets: usize,
    closed: bool,
}

/// Connection double that walks the signaling states the way a browser
/// peer connection does. Candidates containing `bad` are rejected.
#[derive(Debug)]
pub struct FakeConnection {
    peer: PeerId,
    state: Mutex<FakeState>,
}

impl FakeConnection {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                applied: Vec::new(),
                senders: Vec::new(),
                offer_options: Vec::new(),
                remote_sets: 0,
                closed: false,
            }),
        }
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn senders(&self) -> Vec<String> {
        self.state.lock().senders.clone()
    }

    pub fn offer_options(&self) -> Vec<OfferOptions> {
        self.state.lock().offer_options.clone()
    }

    pub fn remote_sets(&self) -> usize {
        self.state.lock().remote_sets
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl NegotiableConnection for FakeConnection {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.offer_options.push(options);
        Ok(SessionDescription::offer(format!(
            "offer-for-{}-{}",
            self.peer,
            state.offer_options.len()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(ConnectionError::Description("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("answer-for-{}", self.peer)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        state.signaling = match (description.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(ConnectionError::Description(format!(
                    "local {kind:?} in {current}"
                )));
            }
        };
        state.local = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.signaling = match (description.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(ConnectionError::Description(format!(
                    "remote {kind:?} in {current}"
                )));
            }
        };
        state.remote = Some(description);
        state.remote_sets += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        if state.remote.is_none() {
            return Err(ConnectionError::Candidate("no remote description".into()));
        }
        if candidate.candidate.contains("bad") {
            return Err(ConnectionError::Candidate(candidate.candidate));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), ConnectionError> {
        self.state.lock().senders.push(track.id().to_string());
        Ok(())
    }

    async fn sender_track_ids(&self) -> Vec<String> {
        self.senders()
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        if self.state.lock().closed {
            ConnectionState::Closed
        } else {
            ConnectionState::New
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Hands out [`FakeConnection`]s and keeps each one's event handle.
#[derive(Default)]
pub struct FakeFactory {
    opened: Mutex<Vec<(PeerId, Arc<FakeConnection>, ConnectionEvents)>>,
    fail: AtomicBool,
}

impl FakeFactory {
    pub fn fail_opens(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn opened_for(&self, peer: &str) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|(id, _, _)| id.as_str() == peer)
            .count()
    }

    /// Latest connection opened for `peer`.
    pub fn connection(&self, peer: &str) -> Arc<FakeConnection> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|(id, _, _)| id.as_str() == peer)
            .map(|(_, conn, _)| Arc::clone(conn))
            .expect("no connection opened for peer")
    }

    /// Event handle of the latest connection opened for `peer`.
    pub fn events(&self, peer: &str) -> ConnectionEvents {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|(id, _, _)| id.as_str() == peer)
            .map(|(_, _, events)| events.clone())
            .expect("no connection opened for peer")
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn open(
        &self,
        peer: &PeerId,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn NegotiableConnection>, ConnectionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Backend("factory offline".into()));
        }
        let connection = Arc::new(FakeConnection::new(peer.clone()));
        self.opened
            .lock()
            .push((peer.clone(), Arc::clone(&connection), events));
        Ok(connection)
    }
}

/// Channel that records outbound envelopes.
pub struct RecordingChannel {
    open: AtomicBool,
    sent: Mutex<Vec<Envelope>>,
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingChannel {
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn offers_to(&self, peer: &str) -> Vec<SessionDescription> {
        self.sent
            .lock()
            .iter()
            .filter_map(|envelope| match envelope {
                Envelope::Offer {
                    target_user_id,
                    sdp,
                    ..
                } if target_user_id.as_str() == peer => Some(sdp.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn answers_to(&self, peer: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|envelope| {
                matches!(envelope, Envelope::Answer { target_user_id, .. } if target_user_id.as_str() == peer)
            })
            .count()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|envelope| envelope.kind() == kind)
            .count()
    }
}

impl SignalChannel for RecordingChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.sent.lock().push(envelope.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn count(&self, predicate: impl Fn(&CallEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    pub fn removed(&self, peer: &str) -> usize {
        self.count(|event| matches!(event, CallEvent::RemoteStreamRemoved { peer: p } if p.as_str() == peer))
    }

    pub fn left(&self, peer: &str) -> usize {
        self.count(|event| matches!(event, CallEvent::ParticipantLeft { peer: p } if p.as_str() == peer))
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: CallEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media source producing one audio and one video track per acquisition.
#[derive(Default)]
pub struct FakeMedia {
    acquired: AtomicUsize,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    unavailable: AtomicBool,
}

impl FakeMedia {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MediaError::Unavailable("no camera".into()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        let made = [TrackKind::Audio, TrackKind::Video].map(|kind| {
            Arc::new(FakeTrack {
                id: format!("{kind:?}-{n}").to_lowercase(),
                kind,
                stopped: AtomicBool::new(false),
            })
        });
        self.tracks.lock().extend(made.iter().cloned());
        Ok(LocalStream::new(
            made.into_iter()
                .map(|track| track as Arc<dyn MediaTrack>)
                .collect(),
        ))
    }
}

/// A `CallService` driven directly by the test, with every collaborator
/// replaced by a recording double.
pub struct Harness {
    pub service: CallService,
    pub channel: Arc<RecordingChannel>,
    pub factory: Arc<FakeFactory>,
    pub media: Arc<FakeMedia>,
    pub sink: Arc<RecordingSink>,
    queue: mpsc::UnboundedReceiver<CallCommand>,
}

impl Harness {
    pub fn new(self_id: &str) -> Self {
        Self::with_config(self_id, CallConfig::default())
    }

    pub fn with_config(self_id: &str, config: CallConfig) -> Self {
        let channel = Arc::new(RecordingChannel::default());
        let factory = Arc::new(FakeFactory::default());
        let media = Arc::new(FakeMedia::default());
        let sink = Arc::new(RecordingSink::default());
        let (tx, queue) = mpsc::unbounded_channel();
        let service = CallService::new(
            LocalIdentity::new(self_id, format!("user-{self_id}")),
            &config,
            channel.clone(),
            factory.clone(),
            media.clone(),
            sink.clone(),
            tx,
        );
        Self {
            service,
            channel,
            factory,
            media,
            sink,
            queue,
        }
    }

    /// Handles every queued command (connection reports, reconnects).
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(command) = self.queue.try_recv() {
            self.service.handle(command).await;
            handled += 1;
        }
        handled
    }

    pub async fn joined(self_id: &str) -> Self {
        let mut harness = Self::new(self_id);
        harness.service.join().await.expect("join");
        harness.channel.clear();
        harness
    }

    pub fn has_session(&self, peer: &str) -> bool {
        self.service.negotiator().registry().contains(&PeerId::from(peer))
    }
}

pub fn offer(from: &str, to: &str, sdp: &str) -> Envelope {
    Envelope::Offer {
        user_id: from.into(),
        target_user_id: to.into(),
        sdp: SessionDescription::offer(sdp),
    }
}

pub fn answer(from: &str, to: &str, sdp: &str) -> Envelope {
    Envelope::Answer {
        user_id: from.into(),
        target_user_id: to.into(),
        sdp: SessionDescription::answer(sdp),
    }
}

pub fn candidate(from: &str, to: &str, line: &str) -> Envelope {
    Envelope::IceCandidate {
        user_id: from.into(),
        target_user_id: to.into(),
        candidate: IceCandidate::new(line),
    }
}

pub fn join_call(from: &str) -> Envelope {
    Envelope::JoinCall {
        user_id: from.into(),
        username: format!("user-{from}"),
    }
}
