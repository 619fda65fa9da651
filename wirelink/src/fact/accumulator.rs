use super::{decode_inner_group, encode_inner_group, Attribute, Fact, Subject, Value};
use crate::{error::FactError, signing::Signer};
use std::time::SystemTime;
use wireguard_control::Key;

/// Conservative upper bound on a UDP datagram's payload, leaving headroom
/// under a 1420-byte WireGuard interface MTU for IP/UDP headers on either
/// address family. Chosen to stay well clear of fragmentation, not to
/// saturate the path MTU.
pub const UDP_MAX_SAFE_PAYLOAD: usize = 1384;

/// Packs facts into size-bounded groups and seals each group into a
/// transmittable `SignedGroup` fact.
///
/// A group never exceeds `budget` bytes once its members are individually
/// encoded; [`add`](Accumulator::add) starts a new group rather than split a
/// fact across two.
pub struct Accumulator {
    budget: usize,
    now: SystemTime,
    groups: Vec<Vec<Fact>>,
    current_len: usize,
}

impl Accumulator {
    pub fn new(budget: usize, now: SystemTime) -> Self {
        Accumulator {
            budget,
            now,
            groups: vec![Vec::new()],
            current_len: 0,
        }
    }

    fn current_group_mut(&mut self) -> &mut Vec<Fact> {
        self.groups.last_mut().expect("accumulator always has a current group")
    }

    /// Adds `fact`, rolling over to a new group if it doesn't fit in the
    /// current one. Fails only if the fact alone exceeds the budget.
    pub fn add(&mut self, fact: Fact) -> Result<(), FactError> {
        let len = fact.encoded_len();
        if len > self.budget {
            return Err(FactError::FactTooLarge);
        }
        if self.current_len + len > self.budget {
            self.groups.push(Vec::new());
            self.current_len = 0;
        }
        self.current_len += len;
        self.current_group_mut().push(fact);
        Ok(())
    }

    /// Adds `fact` only if it fits in the group currently being filled,
    /// without starting a new one. Returns whether it was added.
    pub fn add_if_room(&mut self, fact: Fact) -> bool {
        let len = fact.encoded_len();
        if self.current_len + len > self.budget {
            return false;
        }
        self.current_len += len;
        self.current_group_mut().push(fact);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(Vec::is_empty)
    }

    pub fn group_count(&self) -> usize {
        self.groups.iter().filter(|g| !g.is_empty()).count()
    }

    /// Seals each non-empty group for `recipient`, producing one
    /// `SignedGroup` fact per group. The envelope's subject is the signer's
    /// own public key, never the recipient's; its expiry is `now`, since the
    /// envelope is meant for immediate transmission, not storage.
    pub fn make_signed_groups(&self, signer: &Signer, recipient: &Key) -> Result<Vec<Fact>, FactError> {
        let mut out = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            if group.is_empty() {
                continue;
            }
            let mut plaintext = encode_inner_group(group, self.now)?;
            let (nonce, tag) = signer
                .seal_for(recipient, &mut plaintext)
                .map_err(|e| FactError::Sealing(e.to_string()))?;
            out.push(Fact::new(
                Attribute::SignedGroup,
                Subject::Peer(signer.public_key().clone()),
                Value::SignedGroup {
                    nonce,
                    tag,
                    inner_bytes: plaintext,
                },
                self.now,
            ));
        }
        Ok(out)
    }
}

/// Opens a `SignedGroup` fact produced by [`Accumulator::make_signed_groups`],
/// verifying it against `sender` and returning the facts it carried.
/// Returns `Ok(None)` when the tag fails to verify; the group should simply
/// be discarded, not treated as a hard error.
pub fn open_signed_group(
    signer: &Signer,
    sender: &Key,
    envelope: &Fact,
    packet_time: SystemTime,
) -> Result<Option<Vec<Fact>>, FactError> {
    let Value::SignedGroup {
        nonce,
        tag,
        inner_bytes,
    } = &envelope.value
    else {
        return Err(FactError::Malformed("expected a SignedGroup value"));
    };
    let mut plaintext = inner_bytes.clone();
    let opened = signer
        .open_from(sender, nonce, tag, &mut plaintext)
        .map_err(|e| FactError::Sealing(e.to_string()))?;
    if !opened {
        return Ok(None);
    }
    decode_inner_group(&plaintext, packet_time).map(Some)
}
