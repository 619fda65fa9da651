//! Port of the additive-by-default, replace-on-deconfigure AllowedIPs
//! reconciliation algorithm: WireGuard's own `AllowedIPs` update is
//! additive, so removing an entry requires switching the whole peer update
//! to replace mode and rebuilding the full set.
//!
//! No `bitflags` dependency here; three bits fit comfortably in a `u8` and
//! the set of `IpNet`s involved is always small.

use crate::{
    autopeer::auto_address,
    fact::{Attribute, Fact, Value},
};
use ipnet::IpNet;
use std::{collections::HashMap, net::IpAddr};
use wireguard_control::{AllowedIp, PeerInfo};

const AIP_CURRENT: u8 = 1 << 0;
const AIP_ADDING: u8 = 1 << 1;
const AIP_VALID: u8 = 1 << 2;
const AIP_ALREADY_MASK: u8 = AIP_CURRENT | AIP_ADDING;
const AIP_REBUILD_MASK: u8 = AIP_ADDING | AIP_VALID;

/// An in-progress peer configuration change, accumulated by the reconciler
/// across several concerns (AllowedIPs, endpoint rotation, ...) before being
/// turned into a real [`PeerConfigBuilder`](wireguard_control::PeerConfigBuilder).
#[derive(Debug, Clone)]
pub struct PeerDelta {
    pub endpoint: Option<std::net::SocketAddr>,
    pub allowed_ips: Vec<AllowedIp>,
    pub replace_allowed_ips: bool,
}

impl PeerDelta {
    pub fn empty() -> Self {
        PeerDelta {
            endpoint: None,
            allowed_ips: Vec::new(),
            replace_allowed_ips: false,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.endpoint.is_none() && self.allowed_ips.is_empty() && !self.replace_allowed_ips
    }
}

/// Restricts `delta` to just the peer's own link-local auto-address,
/// replacing whatever else is configured. Used on leaf nodes when a peer
/// goes unhealthy, so it stays reachable transitively via a router instead
/// of through a route we know is currently dead.
pub fn only_auto_ip(peer: &PeerInfo, delta: &mut PeerDelta) {
    let auto = IpAddr::V6(auto_address(&peer.config.public_key));
    delta.replace_allowed_ips = true;
    delta.allowed_ips = vec![AllowedIp { address: auto, cidr: 128 }];
}

/// Adds the peer's link-local auto-address if it isn't already
/// current or pending. Returns whether it was added. Unlike
/// [`ensure_allowed_ips`], this runs unconditionally: the auto-address is
/// the one route that must always work, fact-driven trust aside.
pub fn ensure_peer_auto_ip(peer: &PeerInfo, delta: &mut PeerDelta) -> bool {
    let auto = IpAddr::V6(auto_address(&peer.config.public_key));
    let already_present = peer
        .config
        .allowed_ips
        .iter()
        .chain(delta.allowed_ips.iter())
        .any(|a| a.address == auto && a.cidr == 128);
    if already_present {
        return false;
    }
    delta.allowed_ips.push(AllowedIp { address: auto, cidr: 128 });
    true
}

/// Updates `delta` so that, once applied, `peer`'s AllowedIPs cover every
/// `AllowedCidrV4`/`AllowedCidrV6` fact in `facts` plus the peer's own
/// link-local auto-address (always valid).
///
/// Only ever adds entries unless `allow_deconfigure` is set and the peer
/// currently carries an AllowedIP that isn't backed by any trusted fact, in
/// which case the whole set is rebuilt in replace mode.
pub fn ensure_allowed_ips(peer: &PeerInfo, facts: &[Fact], delta: &mut PeerDelta, allow_deconfigure: bool) {
    let mut flags: HashMap<IpNet, u8> = HashMap::new();

    for aip in &peer.config.allowed_ips {
        if let Ok(net) = IpNet::new(aip.address, aip.cidr) {
            *flags.entry(net).or_insert(0) |= AIP_CURRENT;
        }
    }
    for aip in &delta.allowed_ips {
        if let Ok(net) = IpNet::new(aip.address, aip.cidr) {
            *flags.entry(net).or_insert(0) |= AIP_ADDING;
        }
    }

    let auto_net = IpNet::new(IpAddr::V6(auto_address(&peer.config.public_key)), 128)
        .expect("a /128 is always a valid prefix length");
    *flags.entry(auto_net).or_insert(0) |= AIP_VALID;

    for fact in facts {
        if !matches!(fact.attribute, Attribute::AllowedCidrV4 | Attribute::AllowedCidrV6) {
            continue;
        }
        let Value::IpNet(net) = &fact.value else { continue };
        let entry = flags.entry(*net).or_insert(0);
        *entry |= AIP_VALID;
        if *entry & AIP_ALREADY_MASK != 0 {
            continue;
        }
        delta.allowed_ips.push(AllowedIp {
            address: net.addr(),
            cidr: net.prefix_len(),
        });
        *entry |= AIP_ADDING;
    }

    if allow_deconfigure {
        let needs_replace = flags
            .values()
            .any(|f| f & (AIP_CURRENT | AIP_VALID) == AIP_CURRENT);
        if needs_replace {
            delta.replace_allowed_ips = true;
            delta.allowed_ips = flags
                .into_iter()
                .filter(|(_, f)| f & AIP_REBUILD_MASK != 0)
                .map(|(net, _)| AllowedIp {
                    address: net.addr(),
                    cidr: net.prefix_len(),
                })
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Subject;
    use std::time::{Duration, SystemTime};
    use wireguard_control::{Key, PeerConfigBuilder, PeerStats};

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

    fn cidr_fact(subject: wireguard_control::Key, net: &str) -> Fact {
        Fact::new(
            Attribute::AllowedCidrV4,
            Subject::Peer(subject),
            Value::IpNet(net.parse().unwrap()),
            SystemTime::now() + Duration::from_secs(30),
        )
    }

    #[test]
    fn adds_new_valid_aip_without_touching_existing() {
        let key = Key::generate_private().get_public();
        let peer = peer_info(&key, &["10.0.0.1/32"]);
        let facts = vec![cidr_fact(key.clone(), "10.0.0.2/32")];
        let mut delta = PeerDelta::empty();

        ensure_allowed_ips(&peer, &facts, &mut delta, false);

        assert!(!delta.replace_allowed_ips);
        assert_eq!(delta.allowed_ips.len(), 1);
        assert_eq!(delta.allowed_ips[0].address, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn does_not_readd_already_current_aip() {
        let key = Key::generate_private().get_public();
        let peer = peer_info(&key, &["10.0.0.1/32"]);
        let facts = vec![cidr_fact(key.clone(), "10.0.0.1/32")];
        let mut delta = PeerDelta::empty();

        ensure_allowed_ips(&peer, &facts, &mut delta, false);

        assert!(delta.is_noop());
    }

    #[test]
    fn deconfigure_rebuilds_when_current_aip_is_no_longer_valid() {
        let key = Key::generate_private().get_public();
        let peer = peer_info(&key, &["10.0.0.1/32", "10.0.0.2/32"]);
        // only .1 is backed by a fact now; .2 should be dropped.
        let facts = vec![cidr_fact(key.clone(), "10.0.0.1/32")];
        let mut delta = PeerDelta::empty();

        ensure_allowed_ips(&peer, &facts, &mut delta, true);

        assert!(delta.replace_allowed_ips);
        let addrs: Vec<IpAddr> = delta.allowed_ips.iter().map(|a| a.address).collect();
        assert!(addrs.contains(&"10.0.0.1".parse().unwrap()));
        assert!(!addrs.contains(&"10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn without_deconfigure_stale_aip_is_left_alone() {
        let key = Key::generate_private().get_public();
        let peer = peer_info(&key, &["10.0.0.1/32", "10.0.0.2/32"]);
        let facts = vec![cidr_fact(key.clone(), "10.0.0.1/32")];
        let mut delta = PeerDelta::empty();

        ensure_allowed_ips(&peer, &facts, &mut delta, false);

        assert!(!delta.replace_allowed_ips);
        assert!(delta.allowed_ips.is_empty());
    }

    #[test]
    fn only_auto_ip_replaces_with_a_single_link_local_entry() {
        let key = Key::generate_private().get_public();
        let peer = peer_info(&key, &["10.0.0.0/24", "192.168.1.0/24"]);
        let mut delta = PeerDelta::empty();

        only_auto_ip(&peer, &mut delta);

        assert!(delta.replace_allowed_ips);
        assert_eq!(delta.allowed_ips.len(), 1);
        assert_eq!(delta.allowed_ips[0].cidr, 128);
        assert_eq!(delta.allowed_ips[0].address, IpAddr::V6(auto_address(&key)));
    }

    #[test]
    fn ensure_peer_auto_ip_is_idempotent() {
        let key = Key::generate_private().get_public();
        let auto = auto_address(&key);
        let peer = peer_info(&key, &[&format!("{auto}/128")]);
        let mut delta = PeerDelta::empty();

        assert!(!ensure_peer_auto_ip(&peer, &mut delta));
        assert!(delta.allowed_ips.is_empty());
    }

    #[test]
    fn ensure_peer_auto_ip_adds_when_missing() {
        let key = Key::generate_private().get_public();
        let peer = peer_info(&key, &["10.0.0.0/24"]);
        let mut delta = PeerDelta::empty();

        assert!(ensure_peer_auto_ip(&peer, &mut delta));
        assert_eq!(delta.allowed_ips.len(), 1);
    }

    #[test]
    fn auto_address_is_always_valid_and_never_forces_rebuild() {
        let key = Key::generate_private().get_public();
        let auto = auto_address(&key);
        let peer = peer_info(&key, &[&format!("{auto}/128")]);
        let mut delta = PeerDelta::empty();

        ensure_allowed_ips(&peer, &[], &mut delta, true);

        assert!(!delta.replace_allowed_ips);
    }
}
