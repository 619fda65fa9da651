//! Deterministic public-key -> link-local IPv6 address mapping.
//!
//! Every peer derives the same address from the same public key without
//! any coordination, so the UDP channel to a peer can be opened before any
//! fact about that peer's real endpoint has ever arrived.

use sha2::{Digest, Sha256};
use std::net::Ipv6Addr;
use wireguard_control::Key;

/// `fe80::` followed by the first 64 bits of SHA-256(public key), with the
/// universal/local bit pattern of a standard EUI-64 left untouched (this is
/// an address derivation, not a real MAC-based SLAAC address).
pub fn auto_address(public_key: &Key) -> Ipv6Addr {
    let digest = Sha256::digest(public_key.as_bytes());
    let mut segments = [0u16; 8];
    segments[0] = 0xfe80;
    for (i, chunk) in digest[0..8].chunks_exact(2).enumerate() {
        segments[i + 4] = u16::from_be_bytes([chunk[0], chunk[1]]);
    }
    Ipv6Addr::new(
        segments[0],
        segments[1],
        segments[2],
        segments[3],
        segments[4],
        segments[5],
        segments[6],
        segments[7],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_link_local() {
        let key = Key::generate_private().get_public();
        let a = auto_address(&key);
        let b = auto_address(&key);
        assert_eq!(a, b);
        assert!(a.segments()[0] == 0xfe80);
    }

    #[test]
    fn distinct_keys_differ() {
        let a = auto_address(&Key::generate_private().get_public());
        let b = auto_address(&Key::generate_private().get_public());
        assert_ne!(a, b);
    }
}
