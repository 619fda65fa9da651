//! Per-peer state carried across reconciliation cycles: handshake health and
//! endpoint-rotation bookkeeping. Nothing here is persisted; a restart just
//! starts every peer from [`PeerConfigState::default`].

use std::{
    net::SocketAddr,
    time::{Duration, SystemTime},
};

/// At least as long as WireGuard's own handshake retry window, with headroom
/// for jitter before we decide a peer's handshake has gone stale.
pub const HANDSHAKE_VALIDITY: Duration = Duration::from_secs(135);

/// Minimum spacing between automatic endpoint rotations for one peer, so a
/// freshly-tried candidate gets a fair chance before we move on.
pub const MIN_ENDPOINT_ROTATION_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct PeerConfigState {
    last_handshake: Option<SystemTime>,
    last_endpoint_change: Option<SystemTime>,
    tried_endpoints: Vec<SocketAddr>,
    next_endpoint_index: usize,
    alive_since: Option<SystemTime>,
}

impl PeerConfigState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A peer is handshake-healthy iff it has a recorded handshake within
    /// [`HANDSHAKE_VALIDITY`].
    pub fn is_handshake_healthy(last_handshake: Option<SystemTime>, now: SystemTime) -> bool {
        match last_handshake {
            None => false,
            Some(t) => match now.duration_since(t) {
                Ok(elapsed) => elapsed < HANDSHAKE_VALIDITY,
                Err(_) => true,
            },
        }
    }

    /// A peer is healthy overall iff it has an endpoint and is either
    /// handshake-healthy or its handshake timestamp changed since the last
    /// observation (the kernel is mid-negotiation).
    pub fn is_healthy(&self, endpoint: Option<SocketAddr>, last_handshake: Option<SystemTime>, now: SystemTime) -> bool {
        if endpoint.is_none() {
            return false;
        }
        if Self::is_handshake_healthy(last_handshake, now) {
            return true;
        }
        self.last_handshake.is_some() && self.last_handshake != last_handshake
    }

    /// Records this cycle's observed handshake timestamp for the next call
    /// to [`is_healthy`](Self::is_healthy).
    pub fn observe_handshake(&mut self, last_handshake: Option<SystemTime>) {
        self.last_handshake = last_handshake;
    }

    /// `true` once enough time has passed since the last rotation to try a
    /// new endpoint candidate.
    pub fn time_for_next_endpoint(&self, now: SystemTime) -> bool {
        match self.last_endpoint_change {
            None => true,
            Some(t) => now.duration_since(t).unwrap_or(Duration::ZERO) >= MIN_ENDPOINT_ROTATION_INTERVAL,
        }
    }

    /// Picks the next untried candidate from `candidates`, in order,
    /// wrapping around and marking everything tried once the whole list has
    /// been exhausted. Returns `None` if `candidates` is empty.
    pub fn next_endpoint(&mut self, candidates: &[SocketAddr], now: SystemTime) -> Option<SocketAddr> {
        if candidates.is_empty() {
            return None;
        }
        if self.tried_endpoints.len() >= candidates.len() {
            self.tried_endpoints.clear();
            self.next_endpoint_index = 0;
        }
        let untried = candidates
            .iter()
            .find(|c| !self.tried_endpoints.contains(c))
            .copied()
            .unwrap_or(candidates[self.next_endpoint_index % candidates.len()]);

        self.tried_endpoints.push(untried);
        self.next_endpoint_index = (self.next_endpoint_index + 1) % candidates.len();
        self.last_endpoint_change = Some(now);
        Some(untried)
    }

    /// Records whether this peer currently has an unexpired `Alive` fact.
    /// `alive_since` tracks the start of the current unbroken alive streak,
    /// resetting the moment the fact lapses.
    pub fn observe_alive(&mut self, is_alive_now: bool, now: SystemTime) {
        if is_alive_now {
            self.alive_since.get_or_insert(now);
        } else {
            self.alive_since = None;
        }
    }

    /// How long the current alive streak has lasted, or `None` if the peer
    /// isn't currently alive.
    pub fn alive_duration(&self, now: SystemTime) -> Option<Duration> {
        self.alive_since.map(|t| now.duration_since(t).unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("203.0.113.1:{port}").parse().unwrap()
    }

    #[test]
    fn no_endpoint_is_never_healthy() {
        let state = PeerConfigState::new();
        let now = SystemTime::now();
        assert!(!state.is_healthy(None, Some(now), now));
    }

    #[test]
    fn fresh_handshake_is_healthy() {
        let state = PeerConfigState::new();
        let now = SystemTime::now();
        assert!(state.is_healthy(Some(addr(51820)), Some(now), now));
    }

    #[test]
    fn changed_handshake_is_healthy_even_if_stale() {
        let now = SystemTime::now();
        let long_ago = now - HANDSHAKE_VALIDITY;
        let mut state = PeerConfigState::new();
        state.observe_handshake(Some(long_ago));
        // kernel just renegotiated: timestamp moved from long_ago to now.
        assert!(state.is_healthy(Some(addr(51820)), Some(now), now));
    }

    #[test]
    fn stable_stale_handshake_is_unhealthy() {
        let now = SystemTime::now();
        let long_ago = now - HANDSHAKE_VALIDITY;
        let mut state = PeerConfigState::new();
        state.observe_handshake(Some(long_ago));
        assert!(!state.is_healthy(Some(addr(51820)), Some(long_ago), now));
    }

    #[test]
    fn endpoint_rotation_cycles_through_candidates_without_repeats() {
        let now = SystemTime::now();
        let mut state = PeerConfigState::new();
        let candidates = vec![addr(1), addr(2), addr(3)];

        let first = state.next_endpoint(&candidates, now).unwrap();
        let second = state.next_endpoint(&candidates, now).unwrap();
        let third = state.next_endpoint(&candidates, now).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);

        // exhausted: wraps around and starts trying again.
        let fourth = state.next_endpoint(&candidates, now).unwrap();
        assert!(candidates.contains(&fourth));
    }

    #[test]
    fn rotation_is_rate_limited() {
        let now = SystemTime::now();
        let mut state = PeerConfigState::new();
        state.next_endpoint(&[addr(1), addr(2)], now);
        assert!(!state.time_for_next_endpoint(now + Duration::from_secs(1)));
        assert!(state.time_for_next_endpoint(now + MIN_ENDPOINT_ROTATION_INTERVAL));
    }

    #[test]
    fn alive_streak_resets_when_fact_lapses() {
        let now = SystemTime::now();
        let mut state = PeerConfigState::new();
        state.observe_alive(true, now);
        assert_eq!(state.alive_duration(now + Duration::from_secs(10)), Some(Duration::from_secs(10)));
        state.observe_alive(false, now + Duration::from_secs(10));
        assert_eq!(state.alive_duration(now + Duration::from_secs(11)), None);
    }
}
