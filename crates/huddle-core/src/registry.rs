//! Single owner of all per-identity state.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::envelope::{IceCandidate, PeerId};
use crate::session::PeerSession;

pub const DEFAULT_MAX_PARKED_CANDIDATES: usize = 64;

/// One [`PeerSession`] per identity, plus candidates that arrived before
/// any session existed for their sender.
///
/// Identities whose session was torn down stay retired until a fresh
/// description arrives from them; their candidates belong to the dead
/// connection and are not parked.
#[derive(Debug)]
pub struct PeerRegistry {
    sessions: HashMap<PeerId, PeerSession>,
    parked: HashMap<PeerId, VecDeque<IceCandidate>>,
    retired: HashSet<PeerId>,
    next_generation: u64,
    max_parked: usize,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARKED_CANDIDATES)
    }
}

impl PeerRegistry {
    pub fn new(max_parked: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            parked: HashMap::new(),
            retired: HashSet::new(),
            next_generation: 1,
            max_parked: max_parked.max(1),
        }
    }

    /// Reserves the generation for the next session.
    pub fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    pub fn contains(&self, identity: &PeerId) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn get(&self, identity: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(identity)
    }

    pub fn get_mut(&mut self, identity: &PeerId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(identity)
    }

    /// Registers `session`, adopting any parked candidates for its identity.
    /// An existing session for the same identity is replaced.
    pub fn insert(&mut self, mut session: PeerSession) -> &mut PeerSession {
        let identity = session.identity().clone();
        if let Some(parked) = self.parked.remove(&identity) {
            tracing::debug!(
                target = "huddle::registry",
                peer = %identity,
                count = parked.len(),
                "adopting early candidates"
            );
            session.adopt_candidates(parked);
        }
        match self.sessions.entry(identity) {
            Entry::Occupied(mut entry) => {
                entry.insert(session);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(session),
        }
    }

    pub fn remove(&mut self, identity: &PeerId) -> Option<PeerSession> {
        self.parked.remove(identity);
        self.sessions.remove(identity)
    }

    /// Marks `identity` as torn down and discards anything parked for it.
    pub fn retire(&mut self, identity: &PeerId) {
        self.parked.remove(identity);
        self.retired.insert(identity.clone());
    }

    /// Clears the retired mark once the remote side negotiates afresh.
    pub fn revive(&mut self, identity: &PeerId) -> bool {
        self.retired.remove(identity)
    }

    pub fn is_retired(&self, identity: &PeerId) -> bool {
        self.retired.contains(identity)
    }

    /// Holds a candidate for an identity that has no session yet. Returns
    /// false when the oldest parked candidate had to be dropped.
    pub fn park_candidate(&mut self, identity: &PeerId, candidate: IceCandidate) -> bool {
        let queue = self.parked.entry(identity.clone()).or_default();
        let mut kept_all = true;
        if queue.len() >= self.max_parked {
            queue.pop_front();
            kept_all = false;
            tracing::warn!(
                target = "huddle::registry",
                peer = %identity,
                limit = self.max_parked,
                "parked candidate limit reached; dropping oldest"
            );
        }
        queue.push_back(candidate);
        kept_all
    }

    pub fn take_parked(&mut self, identity: &PeerId) -> VecDeque<IceCandidate> {
        self.parked.remove(identity).unwrap_or_default()
    }

    pub fn parked_len(&self, identity: &PeerId) -> usize {
        self.parked.get(identity).map_or(0, VecDeque::len)
    }

    pub fn identities(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes every session and parked candidate.
    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.parked.clear();
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}
