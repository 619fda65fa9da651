//! Per-(peer, fact) bookkeeping used to suppress redundant gossip.
//!
//! This is an optimistic cache: a wrong answer only changes how much
//! traffic gets sent, never what's correct, so the table needs nothing more
//! than a mutex around the underlying map.

use crate::fact::{Attribute, Fact, FactKey};
use parking_lot::Mutex;
use std::{collections::HashMap, time::SystemTime};
use wireguard_control::Key;

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    received_at: Option<SystemTime>,
    sent_at: Option<SystemTime>,
}

impl Entry {
    fn latest(&self) -> Option<SystemTime> {
        match (self.sent_at, self.received_at) {
            (Some(s), Some(r)) => Some(s.max(r)),
            (Some(s), None) => Some(s),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        }
    }
}

/// Tracks, for every `(peer, fact)` pair ever observed, when we last told
/// that peer about the fact and when that peer last told us about it.
pub struct PeerKnowledgeTable {
    entries: Mutex<HashMap<(Key, FactKey), Entry>>,
    /// Separate from the generic map because an `Alive` fact's value (a boot
    /// UUID) changes every restart, so it would never hit the same fact-key
    /// twice; what matters for liveness is only the most recent expiry.
    alive_until: Mutex<HashMap<Key, SystemTime>>,
}

impl PeerKnowledgeTable {
    pub fn new() -> Self {
        PeerKnowledgeTable {
            entries: Mutex::new(HashMap::new()),
            alive_until: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `fact` was sent to `peer`, future-dated to
    /// `fact.expires` — the moment the peer will stop believing it absent a
    /// resend. Timestamps only advance.
    pub fn upsert_sent(&self, peer: &Key, fact: &Fact) {
        let mut entries = self.entries.lock();
        let entry = entries.entry((peer.clone(), fact.key())).or_default();
        advance(&mut entry.sent_at, fact.expires);
    }

    /// Records that `fact` was received, attributed to `source`. Pass `None`
    /// when no peer's auto-address matches the carrier envelope's UDP
    /// source; the fact is still processed, it simply leaves no knowledge
    /// trail.
    pub fn upsert_received(&self, fact: &Fact, source: Option<&Key>) {
        let Some(source) = source else { return };

        let mut entries = self.entries.lock();
        let entry = entries.entry((source.clone(), fact.key())).or_default();
        advance(&mut entry.received_at, fact.expires);
        drop(entries);

        if fact.attribute == Attribute::Alive {
            let subject = fact.subject.peer_key();
            let mut alive = self.alive_until.lock();
            let slot = alive.entry(subject.clone()).or_insert(fact.expires);
            if fact.expires > *slot {
                *slot = fact.expires;
            }
        }
    }

    /// `true` iff `peer`'s belief about `fact` is stale, or it has never
    /// been told/heard about it at all: the latest of `sent_at`/`received_at`
    /// predates `fact.expires - staleness_window`.
    pub fn peer_needs(&self, peer: &Key, fact: &Fact, staleness_window: std::time::Duration) -> bool {
        let entries = self.entries.lock();
        let deadline = fact
            .expires
            .checked_sub(staleness_window)
            .unwrap_or(std::time::UNIX_EPOCH);
        match entries.get(&(peer.clone(), fact.key())).and_then(Entry::latest) {
            None => true,
            Some(latest) => latest < deadline,
        }
    }

    /// `true` iff we currently hold an unexpired `Alive` fact for `peer`.
    pub fn peer_alive(&self, peer: &Key, now: SystemTime) -> bool {
        self.alive_until
            .lock()
            .get(peer)
            .is_some_and(|&expires| expires > now)
    }
}

impl Default for PeerKnowledgeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(slot: &mut Option<SystemTime>, candidate: SystemTime) {
    match slot {
        Some(existing) if *existing >= candidate => {},
        _ => *slot = Some(candidate),
    }
}
