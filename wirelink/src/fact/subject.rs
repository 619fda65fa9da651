use crate::error::FactError;
use wireguard_control::Key;

const SUBJECT_KIND_PEER: u8 = 1;

/// Who a [`Fact`](super::Fact) is about.
///
/// Only one variant exists today, but the wire format reserves a kind byte
/// so that a future subject type (e.g. a CIDR or a group) doesn't need a
/// new top-level fact attribute namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Peer(Key),
}

impl Subject {
    pub fn peer_key(&self) -> &Key {
        match self {
            Subject::Peer(key) => key,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Subject::Peer(key) => {
                buf.push(SUBJECT_KIND_PEER);
                buf.extend_from_slice(key.as_bytes());
            },
        }
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), FactError> {
        let (&kind, rest) = buf
            .split_first()
            .ok_or(FactError::Malformed("truncated subject"))?;
        match kind {
            SUBJECT_KIND_PEER => {
                if rest.len() < 32 {
                    return Err(FactError::Malformed("truncated peer subject"));
                }
                let (key_bytes, rest) = rest.split_at(32);
                let mut arr = [0u8; 32];
                arr.copy_from_slice(key_bytes);
                Ok((Subject::Peer(Key(arr)), rest))
            },
            _ => Err(FactError::Malformed("unknown subject kind")),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Subject::Peer(_) => 1 + 32,
        }
    }
}
