use crate::error::FactError;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use uuid::Uuid;

const IP_KIND_V4: u8 = 4;
const IP_KIND_V6: u8 = 6;

/// The payload half of a [`Fact`](super::Fact). Which variant is legal for a
/// given [`Attribute`](super::Attribute) is fixed by that attribute; a
/// mismatch is a decode error, never a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    IpPort(SocketAddr),
    IpNet(IpNet),
    Uuid(Uuid),
    SignedGroup {
        nonce: [u8; 24],
        tag: [u8; 16],
        inner_bytes: Vec<u8>,
    },
}

fn encode_ip(addr: IpAddr, buf: &mut Vec<u8>) {
    match addr {
        IpAddr::V4(v4) => {
            buf.push(IP_KIND_V4);
            buf.extend_from_slice(&v4.octets());
        },
        IpAddr::V6(v6) => {
            buf.push(IP_KIND_V6);
            buf.extend_from_slice(&v6.octets());
        },
    }
}

fn decode_ip(buf: &[u8]) -> Result<(IpAddr, &[u8]), FactError> {
    let (&kind, rest) = buf
        .split_first()
        .ok_or(FactError::Malformed("truncated ip"))?;
    match kind {
        IP_KIND_V4 => {
            if rest.len() < 4 {
                return Err(FactError::Malformed("truncated ipv4"));
            }
            let (bytes, rest) = rest.split_at(4);
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Ok((IpAddr::V4(Ipv4Addr::from(octets)), rest))
        },
        IP_KIND_V6 => {
            if rest.len() < 16 {
                return Err(FactError::Malformed("truncated ipv6"));
            }
            let (bytes, rest) = rest.split_at(16);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok((IpAddr::V6(Ipv6Addr::from(octets)), rest))
        },
        _ => Err(FactError::Malformed("unknown ip kind")),
    }
}

impl Value {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Value::IpPort(addr) => {
                encode_ip(addr.ip(), buf);
                buf.extend_from_slice(&addr.port().to_be_bytes());
            },
            Value::IpNet(net) => {
                // Note the field order differs from IpPort: kind, then prefix, then address.
                let (kind, octets): (u8, Vec<u8>) = match net.addr() {
                    IpAddr::V4(v4) => (IP_KIND_V4, v4.octets().to_vec()),
                    IpAddr::V6(v6) => (IP_KIND_V6, v6.octets().to_vec()),
                };
                buf.push(kind);
                buf.push(net.prefix_len());
                buf.extend_from_slice(&octets);
            },
            Value::Uuid(uuid) => {
                buf.extend_from_slice(uuid.as_bytes());
            },
            Value::SignedGroup {
                nonce,
                tag,
                inner_bytes,
            } => {
                buf.extend_from_slice(nonce);
                buf.extend_from_slice(tag);
                buf.extend_from_slice(inner_bytes);
            },
        }
    }

    pub fn decode_ip_port(buf: &[u8]) -> Result<Self, FactError> {
        let (ip, rest) = decode_ip(buf)?;
        if rest.len() != 2 {
            return Err(FactError::Malformed("bad IPPort length"));
        }
        let port = u16::from_be_bytes([rest[0], rest[1]]);
        Ok(Value::IpPort(SocketAddr::new(ip, port)))
    }

    pub fn decode_ip_net(buf: &[u8]) -> Result<Self, FactError> {
        let (&kind, rest) = buf
            .split_first()
            .ok_or(FactError::Malformed("truncated ipnet"))?;
        let (&prefix_len, rest) = rest
            .split_first()
            .ok_or(FactError::Malformed("truncated ipnet"))?;
        let addr = match kind {
            IP_KIND_V4 => {
                if rest.len() != 4 {
                    return Err(FactError::Malformed("bad ipnet v4 length"));
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(rest);
                IpAddr::V4(Ipv4Addr::from(octets))
            },
            IP_KIND_V6 => {
                if rest.len() != 16 {
                    return Err(FactError::Malformed("bad ipnet v6 length"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rest);
                IpAddr::V6(Ipv6Addr::from(octets))
            },
            _ => return Err(FactError::Malformed("unknown ip kind")),
        };
        let net =
            IpNet::new(addr, prefix_len).map_err(|_| FactError::Malformed("bad prefix length"))?;
        Ok(Value::IpNet(net))
    }

    pub fn decode_uuid(buf: &[u8]) -> Result<Self, FactError> {
        if buf.len() != 16 {
            return Err(FactError::Malformed("bad UUID length"));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(buf);
        Ok(Value::Uuid(Uuid::from_bytes(bytes)))
    }

    pub fn decode_signed_group(buf: &[u8]) -> Result<Self, FactError> {
        if buf.len() < 24 + 16 {
            return Err(FactError::Malformed("truncated signed group"));
        }
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&buf[0..24]);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&buf[24..40]);
        let inner_bytes = buf[40..].to_vec();
        Ok(Value::SignedGroup {
            nonce,
            tag,
            inner_bytes,
        })
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Value::IpPort(addr) => match addr {
                SocketAddr::V4(_) => 1 + 4 + 2,
                SocketAddr::V6(_) => 1 + 16 + 2,
            },
            Value::IpNet(net) => match net.addr() {
                IpAddr::V4(_) => 1 + 1 + 4,
                IpAddr::V6(_) => 1 + 1 + 16,
            },
            Value::Uuid(_) => 16,
            Value::SignedGroup { inner_bytes, .. } => 24 + 16 + inner_bytes.len(),
        }
    }
}
