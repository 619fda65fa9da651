//! Turns locally-observable state (this node's own addresses, plus whatever
//! the kernel already knows about WireGuard peers) into the facts this node
//! asserts every cycle.

use crate::{
    fact::{Attribute, Fact, Subject, Value, FACT_TTL},
    net::{selected_addresses, IfaceMatcher},
};
use ipnet::IpNet;
use std::{net::IpAddr, time::SystemTime};
use wireguard_control::{Key, PeerInfo};

fn attrs_for(ip: IpAddr) -> (Attribute, Attribute) {
    if ip.is_ipv4() {
        (Attribute::EndpointV4, Attribute::AllowedCidrV4)
    } else {
        (Attribute::EndpointV6, Attribute::AllowedCidrV6)
    }
}

/// Builds the local-fact set described in the local-fact collector design:
/// self-asserted endpoints/networks from `report`/`hide`-selected interfaces,
/// plus a mirror of what the kernel already has configured for each peer.
/// All facts expire at `now + FACT_TTL`.
pub fn collect(
    local_key: &Key,
    listen_port: u16,
    peers: &[PeerInfo],
    report: &IfaceMatcher,
    hide: &IfaceMatcher,
    now: SystemTime,
) -> nix::Result<Vec<Fact>> {
    let expires = now + FACT_TTL;
    let mut facts = Vec::new();

    for local in selected_addresses(report, hide)? {
        let (endpoint_attr, cidr_attr) = attrs_for(local.address);
        facts.push(Fact::new(
            endpoint_attr,
            Subject::Peer(local_key.clone()),
            Value::IpPort(std::net::SocketAddr::new(local.address, listen_port)),
            expires,
        ));
        if let Ok(net) = IpNet::new(local.address, local.prefix_len) {
            facts.push(Fact::new(
                cidr_attr,
                Subject::Peer(local_key.clone()),
                Value::IpNet(net.trunc()),
                expires,
            ));
        }
    }

    for peer in peers {
        for aip in &peer.config.allowed_ips {
            if let Ok(net) = IpNet::new(aip.address, aip.cidr) {
                let (_, cidr_attr) = attrs_for(aip.address);
                facts.push(Fact::new(
                    cidr_attr,
                    Subject::Peer(peer.config.public_key.clone()),
                    Value::IpNet(net),
                    expires,
                ));
            }
        }
        if let Some(endpoint) = peer.config.endpoint {
            let (endpoint_attr, _) = attrs_for(endpoint.ip());
            facts.push(Fact::new(
                endpoint_attr,
                Subject::Peer(peer.config.public_key.clone()),
                Value::IpPort(endpoint),
                expires,
            ));
        }
    }

    Ok(facts)
}
