//! Address the relay is reachable at.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Address clients should dial for a relay bound to `bound`.
///
/// A wildcard bind (`0.0.0.0` / `::`) is replaced by this machine's primary
/// IP address, falling back to loopback when it cannot be determined.
pub fn reachable_addr(bound: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }

    let ip = local_ip_address::local_ip().unwrap_or_else(|e| {
        tracing::warn!("Failed to get local ip address: {}", e);
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    });
    SocketAddr::new(ip, bound.port())
}
