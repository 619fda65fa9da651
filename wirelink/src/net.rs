//! Local (non-WireGuard) interface enumeration, used by the local-fact
//! collector to discover addresses this node can be reached at.

use crate::error::ConfigError;
use nix::net::if_::InterfaceFlags;
use regex::Regex;
use std::net::{IpAddr, Ipv6Addr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddress {
    pub interface: String,
    pub address: IpAddr,
    pub prefix_len: u8,
}

/// A compiled set of interface-name globs (`*` matches any run of
/// characters, the rest is literal).
pub struct IfaceMatcher {
    patterns: Vec<Regex>,
    default_when_empty: bool,
}

impl IfaceMatcher {
    /// An empty `report_ifaces` list means "every interface qualifies".
    pub fn report(globs: &[String]) -> Result<Self, ConfigError> {
        Self::compile(globs, true)
    }

    /// An empty `hide_ifaces` list means "hide nothing".
    pub fn hide(globs: &[String]) -> Result<Self, ConfigError> {
        Self::compile(globs, false)
    }

    fn compile(globs: &[String], default_when_empty: bool) -> Result<Self, ConfigError> {
        let patterns = globs
            .iter()
            .map(|glob| {
                let escaped = regex::escape(glob).replace(r"\*", ".*");
                Regex::new(&format!("^{escaped}$")).map_err(|e| ConfigError::InvalidGlob(glob.clone(), e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IfaceMatcher {
            patterns,
            default_when_empty,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.patterns.is_empty() {
            self.default_when_empty
        } else {
            self.patterns.iter().any(|p| p.is_match(name))
        }
    }
}

/// Enumerates up, non-loopback, non-point-to-point interface addresses whose
/// interface name is selected by `report` and not excluded by `hide`,
/// skipping link-local addresses (those are the auto-address's territory,
/// not a real endpoint).
pub fn selected_addresses(report: &IfaceMatcher, hide: &IfaceMatcher) -> nix::Result<Vec<LocalAddress>> {
    let mut out = Vec::new();
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || ifaddr
                .flags
                .intersects(InterfaceFlags::IFF_LOOPBACK | InterfaceFlags::IFF_POINTOPOINT)
        {
            continue;
        }
        if !report.matches(&ifaddr.interface_name) || hide.matches(&ifaddr.interface_name) {
            continue;
        }

        let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
            continue;
        };

        let resolved = match (address.as_sockaddr_in(), netmask.as_sockaddr_in()) {
            (Some(a), Some(m)) => Some((IpAddr::V4(a.ip()), u32::from(m.ip()).count_ones() as u8)),
            _ => match (address.as_sockaddr_in6(), netmask.as_sockaddr_in6()) {
                (Some(a), Some(m)) => Some((IpAddr::V6(a.ip()), v6_prefix_len(m.ip()))),
                _ => None,
            },
        };

        let Some((ip, prefix_len)) = resolved else { continue };
        if is_loopback_or_link_local(ip) {
            continue;
        }

        out.push(LocalAddress {
            interface: ifaddr.interface_name.clone(),
            address: ip,
            prefix_len,
        });
    }
    Ok(out)
}

fn v6_prefix_len(mask: Ipv6Addr) -> u8 {
    mask.octets().iter().map(|b| b.count_ones() as u8).sum()
}

fn is_loopback_or_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_list_matches_everything() {
        let report = IfaceMatcher::report(&[]).unwrap();
        assert!(report.matches("eth0"));
        assert!(report.matches("anything"));
    }

    #[test]
    fn empty_hide_list_hides_nothing() {
        let hide = IfaceMatcher::hide(&[]).unwrap();
        assert!(!hide.matches("eth0"));
    }

    #[test]
    fn glob_star_matches_prefix() {
        let report = IfaceMatcher::report(&["eth*".to_string()]).unwrap();
        assert!(report.matches("eth0"));
        assert!(report.matches("eth1"));
        assert!(!report.matches("wlan0"));
    }

    #[test]
    fn v6_prefix_len_counts_set_bits() {
        let mask: Ipv6Addr = "ffff:ffff:ffff:ffff::".parse().unwrap();
        assert_eq!(v6_prefix_len(mask), 64);
    }
}
