//! Turns a trusted fact snapshot into WireGuard peer configuration changes.
//!
//! This module is synchronous and side-effect free: it decides *what* to
//! apply, the pipeline (or a direct caller) is responsible for actually
//! calling [`wireguard_control::DeviceUpdate::apply`] with the result.

mod allowed_ips;
mod peer_state;

pub use allowed_ips::{ensure_allowed_ips, ensure_peer_auto_ip, only_auto_ip, PeerDelta};
pub use peer_state::{PeerConfigState, HANDSHAKE_VALIDITY, MIN_ENDPOINT_ROTATION_INTERVAL};

use crate::{
    config::PeerEntries,
    fact::{group_by_peer, Attribute, Fact, Subject, Value, FACT_TTL},
    peer_knowledge::PeerKnowledgeTable,
    trust,
};
use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    time::{Duration, SystemTime},
};
use wireguard_control::{Key, PeerConfigBuilder, PeerInfo};

/// Configured seed endpoints/CIDRs never expire on their own terms; they're
/// a standing part of the configuration, not something a peer asserted.
/// Long enough that a single startup resolution lasts the life of the
/// process without needing to be refreshed every cycle.
const SEED_FACT_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Synthesizes facts from the configured seed endpoints and AllowedIPs, so a
/// freshly booted node has candidates to try and CIDRs to route toward
/// before any peer has spoken up over the wire. Resolved once at startup;
/// an endpoint that fails to resolve is logged and skipped, not fatal.
pub fn seed_facts(peers: &PeerEntries, now: SystemTime) -> Vec<Fact> {
    let expires = now + SEED_FACT_TTL;
    let mut facts = Vec::new();

    for key in peers.keys() {
        for endpoint in peers.endpoints(key) {
            match endpoint.to_socket_addrs() {
                Ok(addrs) => {
                    for addr in addrs {
                        let attribute = if addr.is_ipv4() { Attribute::EndpointV4 } else { Attribute::EndpointV6 };
                        facts.push(Fact::new(attribute, Subject::Peer(key.clone()), Value::IpPort(addr), expires));
                    }
                },
                Err(e) => log::warn!("failed to resolve configured endpoint '{endpoint}' for {key}: {e}"),
            }
        }
        for net in peers.allowed_ips(key) {
            let attribute = if net.addr().is_ipv4() { Attribute::AllowedCidrV4 } else { Attribute::AllowedCidrV6 };
            facts.push(Fact::new(attribute, Subject::Peer(key.clone()), Value::IpNet(*net), expires));
        }
    }

    facts
}

/// What the reconciler decided to do this cycle.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Peer configuration changes to apply (additions, endpoint changes,
    /// AllowedIPs updates), one builder per affected peer.
    pub updates: Vec<PeerConfigBuilder>,
    /// Peers to remove entirely.
    pub removals: Vec<Key>,
}

/// Per-peer state plus the forced-additive-only behavior of the very first
/// snapshot after startup.
pub struct PeerReconciler {
    states: HashMap<Key, PeerConfigState>,
    first_refresh: bool,
}

impl PeerReconciler {
    pub fn new() -> Self {
        PeerReconciler {
            states: HashMap::new(),
            first_refresh: true,
        }
    }

    /// Runs one reconciliation cycle over the peers currently on the
    /// device, plus any key that shows up in the trusted fact set without
    /// being on the device at all.
    ///
    /// `trusted_facts` is the full merged, trust-filtered fact set for this
    /// cycle. `del_peer_candidates` are the keys of locally-configured peers
    /// whose trust level is at least `DelPeer` — the only peers whose
    /// vouching can trigger removal of others.
    pub fn reconcile(
        &mut self,
        local_key: Option<&Key>,
        peers: &[PeerInfo],
        trusted_facts: &[Fact],
        peer_knowledge: &PeerKnowledgeTable,
        is_router: bool,
        del_peer_candidates: &[Key],
        now: SystemTime,
    ) -> ReconcileOutcome {
        let allow_deconfigure = !self.first_refresh;
        self.first_refresh = false;

        let facts_by_peer = group_by_peer(trusted_facts);

        self.states.retain(|k, _| facts_by_peer.contains_key(k));

        let mut outcome = ReconcileOutcome::default();
        let mut local_peers = std::collections::HashSet::new();
        let mut remove_candidates = Vec::new();

        for peer in peers {
            local_peers.insert(peer.config.public_key.clone());
            let Some(facts) = facts_by_peer.get(&peer.config.public_key) else {
                remove_candidates.push(peer.config.public_key.clone());
                continue;
            };
            let state = self.states.entry(peer.config.public_key.clone()).or_default();
            let alive_now = peer_knowledge.peer_alive(&peer.config.public_key, now);
            if let Some(delta) = configure_peer(peer, facts, state, allow_deconfigure, is_router, alive_now, now) {
                outcome.updates.push(delta.into_builder(&peer.config.public_key));
            }
        }

        // any key with trusted facts that isn't on the device yet gets added
        // with an empty AllowedIPs; the next cycle fills it in.
        for key in facts_by_peer.keys() {
            if local_peers.contains(key) || Some(key) == local_key {
                continue;
            }
            outcome.updates.push(PeerConfigBuilder::new(key));
        }

        let device_has_del_peer_online = !is_router
            && del_peer_candidates.iter().any(|k| {
                self.states
                    .get(k)
                    .and_then(|s| s.alive_duration(now))
                    .is_some_and(|d| d >= FACT_TTL)
            });

        if device_has_del_peer_online {
            for key in remove_candidates {
                let peer = peers.iter().find(|p| p.config.public_key == key);
                let is_peer_router = peer.is_some_and(trust::is_router);
                if !is_peer_router {
                    outcome.removals.push(key);
                }
            }
        }

        outcome
    }
}

impl Default for PeerReconciler {
    fn default() -> Self {
        Self::new()
    }
}

fn configure_peer(
    peer: &PeerInfo,
    facts: &[Fact],
    state: &mut PeerConfigState,
    allow_deconfigure: bool,
    is_router: bool,
    alive_now: bool,
    now: SystemTime,
) -> Option<PeerDelta> {
    let healthy = state.is_healthy(peer.config.endpoint, peer.stats.last_handshake_time, now);
    state.observe_handshake(peer.stats.last_handshake_time);
    state.observe_alive(alive_now, now);

    let mut delta = PeerDelta::empty();

    if healthy {
        if alive_now {
            ensure_allowed_ips(peer, facts, &mut delta, false);
        }
    } else {
        // a router is the network's memory of AllowedIPs; never narrow its
        // peers, or a remote router's own routes, down to the auto-address.
        if allow_deconfigure && !is_router && !trust::is_router(peer) {
            only_auto_ip(peer, &mut delta);
        }
        ensure_peer_auto_ip(peer, &mut delta);

        if state.time_for_next_endpoint(now) {
            let candidates = endpoint_candidates(facts);
            if let Some(endpoint) = state.next_endpoint(&candidates, now) {
                delta.endpoint = Some(endpoint);
            }
        }
    }

    if delta.is_noop() {
        None
    } else {
        Some(delta)
    }
}

fn endpoint_candidates(facts: &[Fact]) -> Vec<SocketAddr> {
    facts
        .iter()
        .filter_map(|f| match (&f.attribute, &f.value) {
            (crate::fact::Attribute::EndpointV4 | crate::fact::Attribute::EndpointV6, crate::fact::Value::IpPort(addr)) => {
                Some(*addr)
            },
            _ => None,
        })
        .collect()
}

impl PeerDelta {
    fn into_builder(self, public_key: &Key) -> PeerConfigBuilder {
        let mut builder = PeerConfigBuilder::new(public_key);
        if let Some(endpoint) = self.endpoint {
            builder = builder.set_endpoint(endpoint);
        }
        if self.replace_allowed_ips {
            builder = builder.replace_allowed_ips();
        }
        if !self.allowed_ips.is_empty() {
            builder = builder.add_allowed_ips(&self.allowed_ips);
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Attribute, Subject, Value};
    use std::time::Duration;
    use wireguard_control::{PeerConfigBuilder as Pcb, PeerStats};

    fn peer_info(key: &Key) -> PeerInfo {
        PeerInfo {
            config: Pcb::new(key).into_peer_config(),
            stats: PeerStats::default(),
        }
    }

    fn endpoint_fact(subject: Key, addr: &str) -> Fact {
        Fact::new(
            Attribute::EndpointV4,
            Subject::Peer(subject),
            Value::IpPort(addr.parse().unwrap()),
            SystemTime::now() + Duration::from_secs(30),
        )
    }

    #[test]
    fn unhealthy_peer_without_endpoint_gets_auto_ip_and_candidate_endpoint() {
        let peer_key = Key::generate_private().get_public();
        let peers = vec![peer_info(&peer_key)];
        let facts = vec![endpoint_fact(peer_key.clone(), "198.51.100.2:51820")];
        let knowledge = PeerKnowledgeTable::new();
        let mut reconciler = PeerReconciler::new();
        let now = SystemTime::now();

        let outcome = reconciler.reconcile(None, &peers, &facts, &knowledge, false, &[], now);

        assert_eq!(outcome.updates.len(), 1);
        assert!(outcome.removals.is_empty());
    }

    #[test]
    fn peer_with_no_facts_is_not_removed_without_a_del_peer_vouching() {
        let peer_key = Key::generate_private().get_public();
        let peers = vec![peer_info(&peer_key)];
        let knowledge = PeerKnowledgeTable::new();
        let mut reconciler = PeerReconciler::new();
        let now = SystemTime::now();

        let outcome = reconciler.reconcile(None, &peers, &[], &knowledge, false, &[], now);
        assert!(outcome.removals.is_empty());
    }

    #[test]
    fn router_node_never_triggers_removal() {
        let del_peer = Key::generate_private().get_public();
        let peer_key = Key::generate_private().get_public();
        let peers = vec![peer_info(&peer_key), peer_info(&del_peer)];
        let knowledge = PeerKnowledgeTable::new();
        let mut reconciler = PeerReconciler::new();
        let now = SystemTime::now();

        // even with a del_peer candidate configured, is_router=true suppresses removal.
        let outcome = reconciler.reconcile(None, &peers, &[], &knowledge, true, &[del_peer], now);
        assert!(outcome.removals.is_empty());
    }

    #[test]
    fn unknown_peer_with_facts_is_added() {
        let new_peer = Key::generate_private().get_public();
        let facts = vec![endpoint_fact(new_peer, "198.51.100.2:51820")];
        let knowledge = PeerKnowledgeTable::new();
        let mut reconciler = PeerReconciler::new();

        let outcome = reconciler.reconcile(None, &[], &facts, &knowledge, false, &[], SystemTime::now());
        assert_eq!(outcome.updates.len(), 1);
    }

    #[test]
    fn local_key_is_never_added_as_its_own_peer() {
        let local_key = Key::generate_private().get_public();
        let facts = vec![endpoint_fact(local_key.clone(), "198.51.100.2:51820")];
        let knowledge = PeerKnowledgeTable::new();
        let mut reconciler = PeerReconciler::new();

        let outcome = reconciler.reconcile(Some(&local_key), &[], &facts, &knowledge, false, &[], SystemTime::now());
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn first_refresh_does_not_narrow_allowed_ips() {
        let peer_key = Key::generate_private().get_public();
        let peer = PeerInfo {
            config: Pcb::new(&peer_key)
                .replace_allowed_ips()
                .add_allowed_ip("10.0.0.9".parse().unwrap(), 32)
                .into_peer_config(),
            stats: PeerStats::default(),
        };
        let peers = vec![peer];
        // no facts at all back up this peer's AllowedIPs, which would
        // normally trigger a replace-mode rebuild on a later cycle.
        let facts = vec![endpoint_fact(peer_key, "198.51.100.2:51820")];
        let knowledge = PeerKnowledgeTable::new();
        let mut reconciler = PeerReconciler::new();

        let outcome = reconciler.reconcile(None, &peers, &facts, &knowledge, false, &[], SystemTime::now());
        for builder in outcome.updates {
            let cfg = builder.into_peer_config();
            assert!(cfg.allowed_ips.is_empty() || cfg.allowed_ips.iter().any(|a| a.cidr == 128));
        }
    }

    #[test]
    fn seed_facts_resolve_configured_endpoints_and_cidrs() {
        let peer_key = Key::generate_private().get_public();
        let mut entries = PeerEntries::default();
        entries.insert(
            peer_key.clone(),
            crate::config::PeerEntry {
                name: None,
                trust: None,
                fact_exchanger: false,
                endpoints: vec!["127.0.0.1:51820".to_string()],
                allowed_ips: vec!["10.0.0.0/24".parse().unwrap()],
                basic: false,
            },
        );

        let facts = seed_facts(&entries, SystemTime::now());

        assert!(facts
            .iter()
            .any(|f| f.attribute == Attribute::EndpointV4
                && f.subject == Subject::Peer(peer_key.clone())
                && f.value == Value::IpPort("127.0.0.1:51820".parse().unwrap())));
        assert!(facts
            .iter()
            .any(|f| f.attribute == Attribute::AllowedCidrV4
                && f.subject == Subject::Peer(peer_key.clone())
                && f.value == Value::IpNet("10.0.0.0/24".parse().unwrap())));
    }

    #[test]
    fn seed_facts_skips_an_endpoint_that_fails_to_resolve_instead_of_panicking() {
        let peer_key = Key::generate_private().get_public();
        let mut entries = PeerEntries::default();
        entries.insert(
            peer_key.clone(),
            crate::config::PeerEntry {
                name: None,
                trust: None,
                fact_exchanger: false,
                endpoints: vec!["not-a-real-host.invalid:51820".to_string()],
                allowed_ips: vec![],
                basic: false,
            },
        );

        let facts = seed_facts(&entries, SystemTime::now());
        assert!(facts.is_empty());
    }
}
