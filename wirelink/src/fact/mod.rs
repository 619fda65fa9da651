//! Binary encoding and decoding of facts, subjects, values, and the signed
//! group envelope. Pure, no I/O: every function here is a total function of
//! its arguments plus the `now`/`packet_time` passed in explicitly, which
//! keeps it trivially testable and safe to call from any pipeline stage.

mod accumulator;
mod attribute;
mod subject;
mod value;

pub use accumulator::{open_signed_group, Accumulator, UDP_MAX_SAFE_PAYLOAD};
pub use attribute::Attribute;
pub use subject::Subject;
pub use value::Value;

use crate::error::FactError;
use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, SystemTime},
};
use wireguard_control::Key;

/// Default lifetime applied to every fact the local collector produces.
pub const FACT_TTL: Duration = Duration::from_secs(255);

/// An assertion about one peer, signed in aggregate with the other facts in
/// its envelope.
///
/// Invariant: `attribute` determines which `subject`/`value` variants are
/// legal; [`decode`](Fact::decode) rejects anything else as
/// [`FactError::Malformed`] rather than letting it through as garbage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub attribute: Attribute,
    pub subject: Subject,
    pub value: Value,
    pub expires: SystemTime,
}

/// Two facts with the same key are the "same fact" for merge/dedup purposes;
/// only their `expires` may differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactKey {
    attribute: Attribute,
    subject_bytes: Vec<u8>,
    value_bytes: Vec<u8>,
}

impl Fact {
    pub fn new(attribute: Attribute, subject: Subject, value: Value, expires: SystemTime) -> Self {
        Fact {
            attribute,
            subject,
            value,
            expires,
        }
    }

    pub fn key(&self) -> FactKey {
        let mut subject_bytes = Vec::new();
        self.subject.encode(&mut subject_bytes);
        let mut value_bytes = Vec::new();
        self.value.encode(&mut value_bytes);
        FactKey {
            attribute: self.attribute,
            subject_bytes,
            value_bytes,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires <= now
    }

    /// Encodes `ttl_s = clamp(expires - now, 0..=255)`. Fails if the fact
    /// expired further in the past than a byte can represent; callers should
    /// have already dropped such facts.
    pub fn encode(&self, now: SystemTime) -> Result<Vec<u8>, FactError> {
        let ttl_s: u8 = match self.expires.duration_since(now) {
            Ok(remaining) => remaining.as_secs().min(255) as u8,
            Err(behind) => {
                if behind.duration().as_secs() > 255 {
                    return Err(FactError::Malformed(
                        "fact expired further in the past than the TTL byte can represent",
                    ));
                }
                0
            },
        };

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(ttl_s);
        buf.push(self.attribute.to_byte());
        self.subject.encode(&mut buf);
        self.value.encode(&mut buf);
        Ok(buf)
    }

    pub fn encoded_len(&self) -> usize {
        1 + 1 + self.subject.encoded_len() + self.value.encoded_len()
    }

    /// Fails with `Malformed` on truncation, an unknown attribute/subject/
    /// value tag, or a combination the attribute doesn't permit.
    pub fn decode(buf: &[u8], packet_time: SystemTime) -> Result<Self, FactError> {
        let (&ttl_s, rest) = buf
            .split_first()
            .ok_or(FactError::Malformed("truncated fact: missing ttl"))?;
        let (&attr_byte, rest) = rest
            .split_first()
            .ok_or(FactError::Malformed("truncated fact: missing attribute"))?;
        let attribute = Attribute::from_byte(attr_byte)?;
        let (subject, rest) = Subject::decode(rest)?;

        let value = match attribute {
            Attribute::AllowedCidrV4 => {
                let v = Value::decode_ip_net(rest)?;
                require_family(&v, true)?;
                v
            },
            Attribute::AllowedCidrV6 => {
                let v = Value::decode_ip_net(rest)?;
                require_family(&v, false)?;
                v
            },
            Attribute::EndpointV4 => {
                let v = Value::decode_ip_port(rest)?;
                require_family(&v, true)?;
                v
            },
            Attribute::EndpointV6 => {
                let v = Value::decode_ip_port(rest)?;
                require_family(&v, false)?;
                v
            },
            Attribute::Alive => Value::decode_uuid(rest)?,
            Attribute::SignedGroup => {
                if !matches!(subject, Subject::Peer(_)) {
                    return Err(FactError::Malformed("SignedGroup subject must be a peer"));
                }
                Value::decode_signed_group(rest)?
            },
            Attribute::MemberMetadata => {
                return Err(FactError::Malformed(
                    "MemberMetadata has no wire encoding in this build",
                ))
            },
            Attribute::Unknown => return Err(FactError::Malformed("Unknown is not a valid wire attribute")),
        };

        let expires = packet_time + Duration::from_secs(ttl_s as u64);
        Ok(Fact {
            attribute,
            subject,
            value,
            expires,
        })
    }
}

fn require_family(value: &Value, want_v4: bool) -> Result<(), FactError> {
    let is_v4 = match value {
        Value::IpNet(net) => matches!(net.addr(), IpAddr::V4(_)),
        Value::IpPort(addr) => addr.is_ipv4(),
        _ => return Ok(()),
    };
    if is_v4 == want_v4 {
        Ok(())
    } else {
        Err(FactError::Malformed("attribute/value address family mismatch"))
    }
}

/// `(len:u16 ‖ fact_bytes)*` — the payload of a `SignedGroup`'s inner bytes.
pub fn encode_inner_group(facts: &[Fact], now: SystemTime) -> Result<Vec<u8>, FactError> {
    let mut buf = Vec::new();
    for fact in facts {
        let encoded = fact.encode(now)?;
        let len: u16 = encoded
            .len()
            .try_into()
            .map_err(|_| FactError::Malformed("fact too large to length-prefix"))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&encoded);
    }
    Ok(buf)
}

/// Fails with `Malformed` on residual bytes or a length that overruns the
/// buffer.
pub fn decode_inner_group(buf: &[u8], packet_time: SystemTime) -> Result<Vec<Fact>, FactError> {
    let mut facts = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(FactError::Malformed("truncated inner group length prefix"));
        }
        let (len_bytes, after_len) = rest.split_at(2);
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if after_len.len() < len {
            return Err(FactError::Malformed("inner group length overruns buffer"));
        }
        let (fact_bytes, after_fact) = after_len.split_at(len);
        facts.push(Fact::decode(fact_bytes, packet_time)?);
        rest = after_fact;
    }
    Ok(facts)
}

/// Merges a list of facts by key, keeping the later `expires` for any
/// duplicate key. Idempotent and commutative up to ordering of the result.
pub fn merge_list(facts: impl IntoIterator<Item = Fact>) -> Vec<Fact> {
    let mut by_key: HashMap<FactKey, Fact> = HashMap::new();
    for fact in facts {
        let key = fact.key();
        match by_key.get(&key) {
            Some(existing) if existing.expires >= fact.expires => {},
            _ => {
                by_key.insert(key, fact);
            },
        }
    }
    by_key.into_values().collect()
}

/// Convenience for grouping a fact set by the peer it concerns, used by the
/// broadcaster and reconciler alike.
pub fn group_by_peer(facts: &[Fact]) -> HashMap<Key, Vec<Fact>> {
    let mut grouped: HashMap<Key, Vec<Fact>> = HashMap::new();
    for fact in facts {
        grouped
            .entry(fact.subject.peer_key().clone())
            .or_default()
            .push(fact.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn sample_fact(expires: SystemTime) -> Fact {
        Fact::new(
            Attribute::EndpointV4,
            Subject::Peer(Key::generate_private().get_public()),
            Value::IpPort(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 51820)),
            expires,
        )
    }

    #[test]
    fn round_trips_at_second_resolution() {
        let now = SystemTime::now();
        let fact = sample_fact(now + Duration::from_secs(42));
        let bytes = fact.encode(now).unwrap();
        let decoded = Fact::decode(&bytes, now).unwrap();
        assert_eq!(decoded.attribute, fact.attribute);
        assert_eq!(decoded.subject, fact.subject);
        assert_eq!(decoded.value, fact.value);
        let drift = decoded
            .expires
            .duration_since(fact.expires)
            .or_else(|e| Ok::<_, std::time::SystemTimeError>(e.duration()))
            .unwrap();
        assert!(drift <= Duration::from_secs(1));
    }

    #[test]
    fn rejects_family_mismatch() {
        let now = SystemTime::now();
        let net: ipnet::IpNet = "10.0.0.0/24".parse().unwrap();
        let fact = Fact::new(
            Attribute::AllowedCidrV6,
            Subject::Peer(Key::generate_private().get_public()),
            Value::IpNet(net),
            now + Duration::from_secs(10),
        );
        let bytes = fact.encode(now).unwrap();
        assert!(Fact::decode(&bytes, now).is_err());
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let now = SystemTime::now();
        let a = sample_fact(now + Duration::from_secs(10));
        let mut b = a.clone();
        b.expires = now + Duration::from_secs(20);
        let c = sample_fact(now + Duration::from_secs(5));

        let left = merge_list(vec![merge_list(vec![a.clone(), b.clone()]), vec![c.clone()]].concat());
        let right = merge_list(vec![a.clone(), merge_list(vec![b.clone(), c.clone()])].concat());
        assert_eq!(left.len(), right.len());

        let merged = merge_list(vec![a.clone(), b.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].expires, b.expires);

        let merged_again = merge_list(merged.clone());
        assert_eq!(merged_again, merged);
    }

    #[test]
    fn inner_group_round_trips() {
        let now = SystemTime::now();
        let facts = vec![
            sample_fact(now + Duration::from_secs(1)),
            sample_fact(now + Duration::from_secs(2)),
        ];
        let bytes = encode_inner_group(&facts, now).unwrap();
        let decoded = decode_inner_group(&bytes, now).unwrap();
        assert_eq!(decoded.len(), facts.len());
    }

    #[test]
    fn inner_group_rejects_residual_bytes() {
        let now = SystemTime::now();
        let mut bytes = encode_inner_group(&[sample_fact(now + Duration::from_secs(1))], now).unwrap();
        bytes.push(0xff);
        assert!(decode_inner_group(&bytes, now).is_err());
    }
}
