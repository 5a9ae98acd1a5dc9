//! Interface scanning (§2 component table). Real interface enumeration is
//! platform-specific and is provided by the hosting runtime, which already
//! owns the socket layer; this module only supplies the classification
//! logic and the discovery-stage plumbing that combines scanned IPs with
//! the currently bound listen ports.

use std::net::IpAddr;

use crate::address::Address;

/// Enumerates the node's local interface addresses. Implemented by the
/// hosting runtime (§6); this crate only consumes the result.
pub trait InterfaceSource: Send + Sync {
    fn local_addresses(&self) -> Vec<IpAddr>;
}

/// Whether `ip` is a publicly routable address, as opposed to loopback,
/// link-local, or a private (RFC 1918 / ULA) range.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback() || v6.is_unspecified() || is_unique_local_v6(v6))
        }
    }
}

fn is_unique_local_v6(v6: std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

/// Combines scanned local IPs with the currently bound listen ports to
/// produce candidate addresses for the discovery stage of §4.1.4. Each
/// public IP is paired with each listen port as a `/ip4|ip6/.../udp/PORT`
/// candidate; private/loopback IPs are dropped before they ever reach the
/// coordinator.
pub fn discover_candidates(source: &dyn InterfaceSource, listen_ports: &[u16]) -> Vec<Address> {
    let mut out = Vec::new();
    for ip in source.local_addresses() {
        if !is_public_ip(ip) {
            continue;
        }
        for &port in listen_ports {
            let raw = match ip {
                IpAddr::V4(v4) => format!("/ip4/{}/udp/{}/quic-v1", v4, port),
                IpAddr::V6(v6) => format!("/ip6/{}/udp/{}/quic-v1", v6, port),
            };
            if let Some(addr) = crate::address::parse_address(&raw) {
                out.push(addr);
            }
        }
    }
    out
}
