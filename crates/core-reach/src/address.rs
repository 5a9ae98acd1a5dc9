//! Address model: opaque multi-component address strings, their priority
//! ordering, and the per-address bookkeeping the coordinator keeps around
//! each one.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

/// A node's network address, e.g. `/ip4/1.2.3.4/udp/4001/quic-v1`.
///
/// Everything beyond the IP and port components is opaque to this crate;
/// addresses are compared and hashed by their full string form.
pub type Address = Multiaddr;

/// Priority of an advertised address. Variants are declared low-to-high so
/// the derived `Ord` matches "higher wins" directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressPriority {
    /// Candidate only, never advertised.
    Unverified,
    /// Last-resort fallback: a local socket we are listening on.
    LocalListen,
    /// A working relay reservation.
    RelayGuarantee,
    /// Proven reachable by dial-back or witness threshold.
    VerifiedDirect,
    /// Operator-declared public address.
    ConfiguredAdvertise,
}

impl AddressPriority {
    /// Whether a verified-table entry at this priority survives §4.1.3 filtering (I2).
    /// Relay and local-listen entries are never stored in the verified table, so this
    /// only needs to distinguish `ConfiguredAdvertise`/`VerifiedDirect` from the rest.
    pub fn is_verified_tier(self) -> bool {
        self >= AddressPriority::VerifiedDirect
    }
}

/// Monotonic "last seen" timestamp. Wrapping `Instant` rather than wall-clock
/// time keeps ordering well-defined even across clock adjustments; only
/// relative ordering (descending by recency) is ever observed.
#[derive(Debug, Clone, Copy)]
pub struct LastSeen(pub Instant);

impl LastSeen {
    pub fn now() -> Self {
        LastSeen(Instant::now())
    }

    pub fn age(&self) -> Duration {
        self.0.elapsed()
    }
}

impl PartialEq for LastSeen {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for LastSeen {}
impl PartialOrd for LastSeen {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for LastSeen {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

/// An address and everything the coordinator knows about it.
///
/// "An entry is never negative-valued" (§3): there is no notion of a
/// negative/penalized entry in this model, only presence or absence.
#[derive(Debug, Clone)]
pub struct AddressEntry {
    pub addr: Address,
    pub priority: AddressPriority,
    pub source: String,
    pub verified: bool,
    pub verified_at: Option<Instant>,
    pub last_seen: LastSeen,
}

impl AddressEntry {
    pub fn new(addr: Address, priority: AddressPriority, source: impl Into<String>) -> Self {
        Self {
            addr,
            priority,
            source: source.into(),
            verified: false,
            verified_at: None,
            last_seen: LastSeen::now(),
        }
    }

    pub fn mark_verified(&mut self) {
        self.verified = true;
        self.verified_at = Some(Instant::now());
        self.priority = AddressPriority::VerifiedDirect.max(self.priority);
        self.last_seen = LastSeen::now();
    }

    pub fn touch(&mut self) {
        self.last_seen = LastSeen::now();
    }
}

/// Rejects the empty address at every ingress boundary (I7).
pub fn is_empty_address(addr: &str) -> bool {
    addr.is_empty()
}

/// Parses a raw address string into an [`Address`], rejecting the empty
/// string up front. Malformed multiaddr syntax is also rejected: a
/// candidate we cannot even parse is not a candidate.
pub fn parse_address(raw: &str) -> Option<Address> {
    if is_empty_address(raw) {
        return None;
    }
    raw.parse::<Multiaddr>().ok()
}

/// Extracts the IP component of a multi-component address, if present.
pub fn ip_component(addr: &Address) -> Option<IpAddr> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

/// Extracts the transport port component (TCP or UDP) of a multi-component address.
pub fn port_component(addr: &Address) -> Option<u16> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Tcp(port) | Protocol::Udp(port) => Some(port),
        _ => None,
    })
}

/// Whether the address's IP component is the unspecified (wildcard) address
/// (`0.0.0.0` / `::`), per I6.
pub fn is_wildcard(addr: &Address) -> bool {
    match ip_component(addr) {
        Some(ip) => ip.is_unspecified(),
        None => false,
    }
}

/// Computes the Sybil-resistance IP prefix for a witness: the IP masked to
/// `ipv4_bits` (IPv4) or `ipv6_bits` (IPv6) significant bits, rendered as a
/// string so it can key a map.
pub fn ip_prefix(ip: IpAddr, ipv4_bits: u8, ipv6_bits: u8) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let bits = ipv4_bits.min(32);
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            let masked = u32::from(v4) & mask;
            format!("{}/{}", std::net::Ipv4Addr::from(masked), bits)
        }
        IpAddr::V6(v6) => {
            let bits = ipv6_bits.min(128);
            let mask: u128 = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            let masked = u128::from(v6) & mask;
            format!("{}/{}", std::net::Ipv6Addr::from(masked), bits)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_matches_spec() {
        assert!(AddressPriority::ConfiguredAdvertise > AddressPriority::VerifiedDirect);
        assert!(AddressPriority::VerifiedDirect > AddressPriority::RelayGuarantee);
        assert!(AddressPriority::RelayGuarantee > AddressPriority::LocalListen);
        assert!(AddressPriority::LocalListen > AddressPriority::Unverified);
    }

    #[test]
    fn empty_address_is_rejected() {
        assert!(parse_address("").is_none());
    }

    #[test]
    fn parses_ip_and_port() {
        let addr = parse_address("/ip4/1.2.3.4/udp/4001/quic-v1").unwrap();
        assert_eq!(ip_component(&addr), Some("1.2.3.4".parse().unwrap()));
        assert_eq!(port_component(&addr), Some(4001));
    }

    #[test]
    fn wildcard_is_detected() {
        let addr = parse_address("/ip4/0.0.0.0/udp/4001/quic-v1").unwrap();
        assert!(is_wildcard(&addr));
        let addr = parse_address("/ip4/1.2.3.4/udp/4001/quic-v1").unwrap();
        assert!(!is_wildcard(&addr));
    }

    #[test]
    fn ip_prefix_masks_ipv4_to_slash_24() {
        let a = ip_prefix("192.168.1.10".parse().unwrap(), 24, 48);
        let b = ip_prefix("192.168.1.11".parse().unwrap(), 24, 48);
        let c = ip_prefix("10.0.0.5".parse().unwrap(), 24, 48);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
