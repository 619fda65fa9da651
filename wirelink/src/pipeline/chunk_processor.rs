//! Authenticates, trust-filters, and merges a chunk of received packets into
//! the node's current view of the mesh.
//!
//! A packet's source IP is always `auto_address(sender)` for some configured
//! peer; a fact's self-asserted `SignedGroup` subject is never trusted on
//! its own; the two are cross-checked before the signature is even opened.

use super::ReceivedFact;
use crate::{
    autopeer::auto_address,
    fact::{self, open_signed_group, Attribute, Fact},
    peer_knowledge::PeerKnowledgeTable,
    signing::Signer,
    trust::{self, CompositeTrust, ConfiguredTrust, Level, RouteBasedTrust},
};
use std::{collections::HashMap, net::IpAddr, sync::Arc, time::SystemTime};
use tokio::sync::mpsc;
use wireguard_control::{Key, PeerInfo};

/// Finds the configured peer whose derived auto-address matches `addr`, if
/// any. Used to attribute a received packet to a peer identity that doesn't
/// depend on anything the packet itself claims.
pub fn peer_by_auto_address(peers: &[PeerInfo], addr: IpAddr) -> Option<&Key> {
    peers
        .iter()
        .find(|p| IpAddr::V6(auto_address(&p.config.public_key)) == addr)
        .map(|p| &p.config.public_key)
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut rx: mpsc::Receiver<Vec<ReceivedFact>>,
    tx: mpsc::Sender<Vec<Fact>>,
    peers: Arc<dyn Fn() -> Vec<PeerInfo> + Send + Sync>,
    trust_config: Arc<HashMap<Key, Level>>,
    peer_knowledge: Arc<PeerKnowledgeTable>,
    signer: Arc<Signer>,
    local_key: Key,
) {
    let mut carryover: Vec<Fact> = Vec::new();

    while let Some(chunk) = rx.recv().await {
        let now = SystemTime::now();
        let current_peers = peers();

        let mut opened = Vec::new();
        for received in chunk {
            if let Some((sender, facts)) = open_one(&received, &current_peers, &signer, now) {
                for fact in facts {
                    peer_knowledge.upsert_received(&fact, Some(&sender));
                    opened.push((sender.clone(), fact));
                }
            }
        }

        let configured = ConfiguredTrust::new(&trust_config);
        let route_based = RouteBasedTrust::new(&current_peers);
        let composite = CompositeTrust::new(vec![Box::new(configured), Box::new(route_based)]);

        let accepted = opened.into_iter().filter_map(|(sender, fact)| {
            let known = composite.is_known(&fact.subject, &current_peers) || fact.subject.peer_key() == &local_key;
            let level = composite.trust_level(&fact, &sender);
            if trust::should_accept(fact.attribute, known, level) {
                Some(fact)
            } else {
                log::debug!(
                    "dropping fact {:?} from {sender}: trust level {level:?} insufficient",
                    fact.attribute
                );
                None
            }
        });

        let still_valid = carryover.into_iter().filter(|f| !f.is_expired(now));
        let merged = fact::merge_list(still_valid.chain(accepted));
        carryover = merged.clone();

        if tx.send(merged).await.is_err() {
            return;
        }
    }
}

/// Opens one received packet, if it is a valid, authenticated `SignedGroup`.
/// Returns the verified sender and the facts it carried.
fn open_one(
    received: &ReceivedFact,
    peers: &[PeerInfo],
    signer: &Signer,
    now: SystemTime,
) -> Option<(Key, Vec<Fact>)> {
    if received.fact.attribute != Attribute::SignedGroup {
        log::debug!("dropping non-SignedGroup packet from {}", received.source);
        return None;
    }

    let Some(sender_by_source) = peer_by_auto_address(peers, received.source.ip()) else {
        log::debug!("dropping packet from unrecognized source {}", received.source);
        return None;
    };

    if received.fact.subject.peer_key() != sender_by_source {
        log::warn!(
            "dropping packet from {}: claimed sender does not match source address",
            received.source
        );
        return None;
    }

    let sender = sender_by_source.clone();
    match open_signed_group(signer, &sender, &received.fact, now) {
        Ok(Some(facts)) => Some((sender, facts)),
        Ok(None) => {
            log::warn!("dropping packet from {sender}: signature failed to verify");
            None
        },
        Err(e) => {
            log::warn!("dropping packet from {sender}: {e}");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Subject, Value};
    use std::time::Duration;
    use wireguard_control::{PeerConfigBuilder, PeerStats};

    fn peer_info(key: &Key) -> PeerInfo {
        PeerInfo {
            config: PeerConfigBuilder::new(key).into_peer_config(),
            stats: PeerStats::default(),
        }
    }

    #[test]
    fn peer_lookup_matches_derived_address() {
        let key = Key::generate_private().get_public();
        let peers = vec![peer_info(&key)];
        let addr = IpAddr::V6(auto_address(&key));
        assert_eq!(peer_by_auto_address(&peers, addr), Some(&key));
    }

    #[test]
    fn peer_lookup_misses_unknown_address() {
        let peers: Vec<PeerInfo> = vec![];
        assert_eq!(peer_by_auto_address(&peers, "::1".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn opens_authenticates_and_forwards_a_signed_group() {
        let alice_priv = Key::generate_private();
        let alice_pub = alice_priv.get_public();
        let bob_priv = Key::generate_private();
        let bob_pub = bob_priv.get_public();

        let alice_signer = Arc::new(Signer::new(&alice_priv));
        let bob_signer = Signer::new(&bob_priv);

        let inner = Fact::new(
            Attribute::EndpointV4,
            Subject::Peer(bob_pub.clone()),
            Value::IpPort("198.51.100.5:51820".parse().unwrap()),
            SystemTime::now() + Duration::from_secs(30),
        );
        let now = SystemTime::now();
        let mut acc = fact::Accumulator::new(fact::UDP_MAX_SAFE_PAYLOAD, now);
        acc.add(inner).unwrap();
        let groups = acc.make_signed_groups(&bob_signer, &alice_pub).unwrap();
        assert_eq!(groups.len(), 1);

        let bob_as_peer = peer_info(&bob_pub);
        let source = std::net::SocketAddr::new(IpAddr::V6(auto_address(&bob_pub)), 54321);

        let (chunk_tx, chunk_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let peer_knowledge = Arc::new(PeerKnowledgeTable::new());
        let trust_config = Arc::new(HashMap::from([(bob_pub.clone(), Level::Membership)]));
        let peers_fn: Arc<dyn Fn() -> Vec<PeerInfo> + Send + Sync> = Arc::new(move || vec![bob_as_peer.clone()]);

        tokio::spawn(run(
            chunk_rx,
            out_tx,
            peers_fn,
            trust_config,
            peer_knowledge,
            alice_signer,
            alice_pub.clone(),
        ));

        chunk_tx
            .send(vec![ReceivedFact {
                fact: groups.into_iter().next().unwrap(),
                source,
            }])
            .await
            .unwrap();

        let merged = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].attribute, Attribute::EndpointV4);
    }

    #[tokio::test]
    async fn mismatched_claimed_sender_is_dropped() {
        let alice_priv = Key::generate_private();
        let alice_pub = alice_priv.get_public();
        let bob_priv = Key::generate_private();
        let bob_pub = bob_priv.get_public();
        let mallory_pub = Key::generate_private().get_public();

        let alice_signer = Arc::new(Signer::new(&alice_priv));
        let bob_signer = Signer::new(&bob_priv);

        let now = SystemTime::now();
        let mut acc = fact::Accumulator::new(fact::UDP_MAX_SAFE_PAYLOAD, now);
        acc.add(Fact::new(
            Attribute::EndpointV4,
            Subject::Peer(bob_pub.clone()),
            Value::IpPort("198.51.100.5:51820".parse().unwrap()),
            now + Duration::from_secs(30),
        ))
        .unwrap();
        let group = acc
            .make_signed_groups(&bob_signer, &alice_pub)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        // packet physically arrives from mallory's derived address, not bob's.
        let source = std::net::SocketAddr::new(IpAddr::V6(auto_address(&mallory_pub)), 1);

        let (chunk_tx, chunk_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let peer_knowledge = Arc::new(PeerKnowledgeTable::new());
        let trust_config = Arc::new(HashMap::new());
        let bob_peer = peer_info(&bob_pub);
        let mallory_peer = peer_info(&mallory_pub);
        let peers_fn: Arc<dyn Fn() -> Vec<PeerInfo> + Send + Sync> =
            Arc::new(move || vec![bob_peer.clone(), mallory_peer.clone()]);

        tokio::spawn(run(
            chunk_rx,
            out_tx,
            peers_fn,
            trust_config,
            peer_knowledge,
            alice_signer,
            alice_pub,
        ));

        chunk_tx.send(vec![ReceivedFact { fact: group, source }]).await.unwrap();
        drop(chunk_tx);

        let merged = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(merged.is_empty());
    }
}
