//! Classifies caller addresses as internal or external.
//!
//! A classifier is built once from a flat list of CIDR strings and never
//! changes; a configuration reload builds a new one.

use crate::errors::{ShareError, ShareResult};
use ipnet::IpNet;
use std::{fmt, net::IpAddr, str::FromStr};
use tracing::debug;

/// Private LAN, VPN (CGNAT), container bridge and loopback ranges.
pub const DEFAULT_INTERNAL_NETWORKS: [&str; 7] = [
    "192.168.0.0/16",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "::1/128",
    "fc00::/7",
];

#[derive(Clone, PartialEq, Eq)]
pub struct NetworkClassifier {
    networks: Vec<IpNet>,
}

impl NetworkClassifier {
    /// Parse every entry. Any invalid entry fails the whole list, so a typo
    /// can't silently shrink the internal range set.
    pub fn from_cidrs<I, S>(entries: I) -> ShareResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let networks = entries
            .into_iter()
            .map(|entry| parse_network(entry.as_ref()))
            .collect::<ShareResult<Vec<_>>>()?;
        Ok(Self { networks })
    }

    pub fn defaults() -> Self {
        Self::from_cidrs(DEFAULT_INTERNAL_NETWORKS).unwrap_or_else(|_| Self {
            networks: Vec::new(),
        })
    }

    /// True if `address` parses and falls inside any configured range.
    /// Unparseable input is external.
    pub fn is_internal(&self, address: &str) -> bool {
        match parse_address(address) {
            Some(ip) => self.is_internal_ip(ip),
            None => {
                debug!(address, "unparseable caller address treated as external");
                false
            }
        }
    }

    pub fn is_internal_ip(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        self.networks.iter().any(|net| net.contains(&ip))
    }

    /// Normalised CIDR strings, in configured order.
    pub fn cidrs(&self) -> Vec<String> {
        self.networks.iter().map(ToString::to_string).collect()
    }
}

impl fmt::Debug for NetworkClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.cidrs()).finish()
    }
}

/// Accepts `a.b.c.d/len`, `v6/len`, or a bare address (single host).
/// Host bits are cleared, so `192.168.1.7/24` means `192.168.1.0/24`.
fn parse_network(entry: &str) -> ShareResult<IpNet> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(ShareError::InvalidNetwork {
            entry: entry.to_string(),
            reason: "empty entry".into(),
        });
    }

    if trimmed.contains('/') {
        IpNet::from_str(trimmed)
            .map(|net| net.trunc())
            .map_err(|err| ShareError::InvalidNetwork {
                entry: entry.to_string(),
                reason: err.to_string(),
            })
    } else {
        IpAddr::from_str(trimmed)
            .map(IpNet::from)
            .map_err(|err| ShareError::InvalidNetwork {
                entry: entry.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Parse a caller address. Tolerates a `[v6]` or `v4:port` socket form.
fn parse_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if let Ok(ip) = IpAddr::from_str(raw) {
        return Some(ip);
    }
    if let Ok(sock) = std::net::SocketAddr::from_str(raw) {
        return Some(sock.ip());
    }
    raw.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inner| IpAddr::from_str(inner).ok())
}

/// `::ffff:a.b.c.d` is matched against IPv4 ranges.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
