//! Deciding which received facts are authoritative enough to mutate local
//! state. Two evaluators are composed first-nonzero-wins: the operator's
//! static configuration, and route-based trust inferred from the sender's
//! current WireGuard `AllowedIPs`.

use crate::fact::{Attribute, Fact, Subject};
use ipnet::IpNet;
use std::collections::HashMap;
use wireguard_control::{Key, PeerInfo};

/// Minimum authority required to accept a class of fact, ordered from least
/// to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Untrusted,
    Endpoint,
    AllowedIps,
    Membership,
    DelPeer,
}

impl Level {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "untrusted" => Some(Level::Untrusted),
            "endpoint" => Some(Level::Endpoint),
            "allowed-ips" => Some(Level::AllowedIps),
            "membership" => Some(Level::Membership),
            "del-peer" => Some(Level::DelPeer),
            _ => None,
        }
    }
}

/// A source of trust levels for facts, keyed by the peer that sourced them.
pub trait TrustEvaluator {
    /// `None` means this evaluator has no opinion; composition moves on to
    /// the next one.
    fn trust_level(&self, fact: &Fact, source: &Key) -> Option<Level>;
}

/// Looks up the operator's configured trust level for the source peer,
/// regardless of the fact's subject.
pub struct ConfiguredTrust<'a> {
    levels: &'a HashMap<Key, Level>,
}

impl<'a> ConfiguredTrust<'a> {
    pub fn new(levels: &'a HashMap<Key, Level>) -> Self {
        ConfiguredTrust { levels }
    }
}

impl TrustEvaluator for ConfiguredTrust<'_> {
    fn trust_level(&self, _fact: &Fact, source: &Key) -> Option<Level> {
        self.levels.get(source).copied()
    }
}

/// A peer is trusted at `AllowedIps` level for any subject whose address it
/// routes for, and always trusted at `Endpoint` level to speak for itself.
pub struct RouteBasedTrust<'a> {
    peers: &'a [PeerInfo],
}

impl<'a> RouteBasedTrust<'a> {
    pub fn new(peers: &'a [PeerInfo]) -> Self {
        RouteBasedTrust { peers }
    }

    fn peer(&self, key: &Key) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| &p.config.public_key == key)
    }
}

impl TrustEvaluator for RouteBasedTrust<'_> {
    fn trust_level(&self, fact: &Fact, source: &Key) -> Option<Level> {
        let subject_key = fact.subject.peer_key();
        if subject_key == source {
            return Some(Level::Endpoint);
        }
        let peer = self.peer(source)?;
        let subject_addr = match &fact.value {
            crate::fact::Value::IpNet(net) => net.addr(),
            crate::fact::Value::IpPort(addr) => addr.ip(),
            _ => return None,
        };
        let routes_for_subject = peer
            .config
            .allowed_ips
            .iter()
            .any(|aip| allowed_ip_covers(aip, subject_addr));
        if routes_for_subject {
            Some(Level::AllowedIps)
        } else {
            None
        }
    }
}

fn allowed_ip_covers(aip: &wireguard_control::AllowedIp, addr: std::net::IpAddr) -> bool {
    match IpNet::new(aip.address, aip.cidr) {
        Ok(net) => net.contains(&addr),
        Err(_) => false,
    }
}

/// First-nonzero-wins composition of any number of evaluators.
pub struct CompositeTrust<'a> {
    evaluators: Vec<Box<dyn TrustEvaluator + 'a>>,
}

impl<'a> CompositeTrust<'a> {
    pub fn new(evaluators: Vec<Box<dyn TrustEvaluator + 'a>>) -> Self {
        CompositeTrust { evaluators }
    }

    pub fn trust_level(&self, fact: &Fact, source: &Key) -> Level {
        for evaluator in &self.evaluators {
            if let Some(level) = evaluator.trust_level(fact, source) {
                if level > Level::Untrusted {
                    return level;
                }
            }
        }
        Level::Untrusted
    }

    pub fn is_known(&self, subject: &Subject, peers: &[PeerInfo]) -> bool {
        let key = subject.peer_key();
        peers.iter().any(|p| &p.config.public_key == key)
    }
}

/// `true` iff a fact with `attr` may be accepted given the sender's
/// `level` and whether the subject is currently a known WireGuard peer.
pub fn should_accept(attr: Attribute, known: bool, level: Level) -> bool {
    let required = match attr {
        Attribute::EndpointV4 | Attribute::EndpointV6 => {
            if known {
                Level::Endpoint
            } else {
                Level::AllowedIps
            }
        },
        Attribute::AllowedCidrV4 | Attribute::AllowedCidrV6 => Level::AllowedIps,
        Attribute::Alive => Level::Endpoint,
        Attribute::MemberMetadata => Level::Membership,
        Attribute::SignedGroup | Attribute::Unknown => return false,
    };
    level >= required
}

/// A heuristic "is this peer a router" check used by the reconciler: a peer
/// is treated as a router if any of its AllowedIPs covers more than a single
/// host.
pub fn is_router(peer: &PeerInfo) -> bool {
    peer.config.allowed_ips.iter().any(|aip| match aip.address {
        std::net::IpAddr::V4(_) => aip.cidr < 32,
        std::net::IpAddr::V6(_) => aip.cidr < 128,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Value;
    use std::time::{Duration, SystemTime};
    use wireguard_control::{PeerConfigBuilder, PeerStats};

    fn cidr_fact(subject: Key, net: IpNet) -> Fact {
        Fact::new(
            Attribute::AllowedCidrV4,
            Subject::Peer(subject),
            Value::IpNet(net),
            SystemTime::now() + Duration::from_secs(30),
        )
    }

    fn peer_info(key: &Key, allowed_ips: &[&str]) -> PeerInfo {
        let mut builder = PeerConfigBuilder::new(key).replace_allowed_ips();
        for aip in allowed_ips {
            let net: IpNet = aip.parse().unwrap();
            builder = builder.add_allowed_ip(net.addr(), net.prefix_len());
        }
        PeerInfo {
            config: builder.into_peer_config(),
            stats: PeerStats::default(),
        }
    }

    #[test]
    fn configured_trust_wins_when_present() {
        let source = Key::generate_private().get_public();
        let mut levels = HashMap::new();
        levels.insert(source.clone(), Level::Membership);
        let evaluator = ConfiguredTrust::new(&levels);
        let subject = Key::generate_private().get_public();
        let fact = cidr_fact(subject, "10.0.0.0/24".parse().unwrap());
        assert_eq!(evaluator.trust_level(&fact, &source), Some(Level::Membership));
    }

    #[test]
    fn route_based_trust_from_allowed_ips() {
        let source = Key::generate_private().get_public();
        let subject = Key::generate_private().get_public();
        let peers = vec![peer_info(&source, &["10.0.0.0/24"])];
        let evaluator = RouteBasedTrust::new(&peers);
        let fact = cidr_fact(subject, "10.0.0.5/32".parse().unwrap());
        assert_eq!(evaluator.trust_level(&fact, &source), Some(Level::AllowedIps));
    }

    #[test]
    fn self_asserted_endpoint_is_always_trusted() {
        let source = Key::generate_private().get_public();
        let peers: Vec<PeerInfo> = vec![];
        let evaluator = RouteBasedTrust::new(&peers);
        let fact = Fact::new(
            Attribute::EndpointV4,
            Subject::Peer(source.clone()),
            Value::IpPort("1.2.3.4:51820".parse().unwrap()),
            SystemTime::now() + Duration::from_secs(30),
        );
        assert_eq!(evaluator.trust_level(&fact, &source), Some(Level::Endpoint));
    }

    #[test]
    fn should_accept_matches_truth_table() {
        assert!(should_accept(Attribute::EndpointV4, true, Level::Endpoint));
        assert!(!should_accept(Attribute::EndpointV4, true, Level::Untrusted));
        assert!(should_accept(Attribute::EndpointV4, false, Level::AllowedIps));
        assert!(!should_accept(Attribute::EndpointV4, false, Level::Endpoint));
        assert!(should_accept(Attribute::AllowedCidrV4, false, Level::AllowedIps));
        assert!(should_accept(Attribute::Alive, true, Level::Endpoint));
        assert!(!should_accept(Attribute::SignedGroup, true, Level::DelPeer));
    }
}
