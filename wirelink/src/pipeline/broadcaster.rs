//! Decides which peers get gossip this cycle and sends it to them.
//!
//! Every peer gets either nothing, a bare "I'm here" ping, or a full batch
//! of facts, depending on how much it's trusted and whether it's configured
//! as a fact exchanger. A peer that already knows everything it would be
//! sent this cycle still gets a ping, so its handshake stays alive.

use super::{ALIVE_PERIOD, STALENESS_WINDOW};
use crate::{
    autopeer::auto_address,
    fact::{self, Accumulator, Attribute, Fact, Subject, Value, FACT_TTL, UDP_MAX_SAFE_PAYLOAD},
    peer_knowledge::PeerKnowledgeTable,
    signing::Signer,
    trust::Level,
};
use std::{collections::HashMap, net::IpAddr, time::SystemTime};
use tokio::net::UdpSocket;
use wireguard_control::{Key, PeerInfo};

/// How much, if anything, a peer should receive this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendLevel {
    Nothing,
    Ping,
    Facts,
}

/// `Facts` for anyone trusted enough to be a fact exchanger (or everyone,
/// under `chatty`); `Ping` for any other known, trusted peer, so its
/// handshake stays alive even though it gets no gossip; `Nothing` for a peer
/// we don't trust at all.
pub fn should_send_to(peer_trust: Level, is_fact_exchanger: bool, chatty: bool) -> SendLevel {
    if peer_trust == Level::Untrusted {
        return SendLevel::Nothing;
    }
    if is_fact_exchanger || chatty {
        SendLevel::Facts
    } else {
        SendLevel::Ping
    }
}

/// Builds this cycle's own `Alive` fact. The value is fixed for the life of
/// the process (the boot ID): only the expiry moves, so a peer that already
/// has this boot's ping on file is correctly recognized as needing nothing,
/// instead of every cycle looking like a brand new fact.
fn ping_fact(local_key: &Key, boot_id: uuid::Uuid, now: SystemTime) -> Fact {
    Fact::new(
        Attribute::Alive,
        Subject::Peer(local_key.clone()),
        Value::Uuid(boot_id),
        now + ALIVE_PERIOD,
    )
}

/// Sends each peer whatever [`should_send_to`] decides it should get,
/// tracking what's been sent in `peer_knowledge` so redundant facts aren't
/// repeated every cycle.
#[allow(clippy::too_many_arguments)]
pub async fn broadcast_once(
    socket: &UdpSocket,
    local_key: &Key,
    local_port: u16,
    boot_id: uuid::Uuid,
    peers: &[PeerInfo],
    facts: &[Fact],
    peer_trust: &HashMap<Key, Level>,
    fact_exchangers: &HashMap<Key, bool>,
    chatty: bool,
    signer: &Signer,
    peer_knowledge: &PeerKnowledgeTable,
    now: SystemTime,
) {
    let ping = ping_fact(local_key, boot_id, now);

    for peer in peers {
        let key = &peer.config.public_key;
        let level = peer_trust.get(key).copied().unwrap_or(Level::Untrusted);
        let exchanger = fact_exchangers.get(key).copied().unwrap_or(false);

        match should_send_to(level, exchanger, chatty) {
            SendLevel::Nothing => continue,
            SendLevel::Ping => {
                if peer_knowledge.peer_needs(key, &ping, FACT_TTL - ALIVE_PERIOD) {
                    peer_knowledge.upsert_sent(key, &ping);
                    send_fact(socket, key, local_port, &ping, now).await;
                }
            },
            SendLevel::Facts => {
                let mut acc = Accumulator::new(UDP_MAX_SAFE_PAYLOAD, now);
                for fact in facts {
                    if fact.subject.peer_key() == key {
                        // the peer is the subject of its own fact; it already knows.
                        continue;
                    }
                    if !peer_knowledge.peer_needs(key, fact, STALENESS_WINDOW) {
                        continue;
                    }
                    if acc.add(fact.clone()).is_ok() {
                        peer_knowledge.upsert_sent(key, fact);
                    }
                }
                if peer_knowledge.peer_needs(key, &ping, FACT_TTL - ALIVE_PERIOD) && acc.add_if_room(ping.clone()) {
                    peer_knowledge.upsert_sent(key, &ping);
                }

                if acc.is_empty() {
                    continue;
                }
                match acc.make_signed_groups(signer, key) {
                    Ok(groups) => {
                        for group in groups {
                            send_fact(socket, key, local_port, &group, now).await;
                        }
                    },
                    Err(e) => log::warn!("failed to seal fact group for {key}: {e}"),
                }
            },
        }
    }
}

async fn send_fact(socket: &UdpSocket, peer: &Key, local_port: u16, fact: &Fact, now: SystemTime) {
    let bytes = match fact.encode(now) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("failed to encode outgoing fact for {peer}: {e}");
            return;
        },
    };
    let dest = std::net::SocketAddr::new(IpAddr::V6(auto_address(peer)), local_port);
    if let Err(e) = socket.send_to(&bytes, dest).await {
        // no route to a peer we haven't configured yet is routine, not an error.
        if e.raw_os_error() != libc_destaddrreq() {
            log::warn!("failed to send fact to {peer} at {dest}: {e}");
        }
    }
}

/// Sending to a peer whose route isn't configured in the kernel yet fails
/// with `EDESTADDRREQ`; that's routine, not an error worth logging. `None`
/// on platforms without that errno, so the check simply never matches.
#[cfg(unix)]
fn libc_destaddrreq() -> Option<i32> {
    Some(nix::errno::Errno::EDESTADDRREQ as i32)
}

#[cfg(not(unix))]
fn libc_destaddrreq() -> Option<i32> {
    None
}

/// Groups facts by the peers they mention and folds in this node's own
/// locally-collected facts, the input a broadcast cycle works from.
pub fn facts_to_send(local: Vec<Fact>, remote: &[Fact]) -> Vec<Fact> {
    fact::merge_list(local.into_iter().chain(remote.iter().cloned()))
}
