//! Classification of candidate IP addresses into version and scope, used by
//! the telemetry sampler to decide which field of a stats sample an endpoint
//! belongs in.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IpVersion {
    V4,
    V6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IpScope {
    /// Not routable on the public internet: RFC 1918 and CGNAT ranges,
    /// loopback and link-local for v4; loopback, ULA and link-local for v6.
    Private,
    Public,
}

pub(crate) fn classify(addr: &IpAddr) -> (IpVersion, IpScope) {
    match addr {
        IpAddr::V4(v4) => (IpVersion::V4, v4_scope(v4)),
        IpAddr::V6(v6) => (IpVersion::V6, v6_scope(v6)),
    }
}

/// Classifies an IP literal. Returns `None` if the string is not an IP
/// address (transport stats may surface mDNS hostnames as candidates).
pub(crate) fn classify_str(s: &str) -> Option<(IpVersion, IpScope)> {
    s.parse::<IpAddr>().ok().map(|addr| classify(&addr))
}

fn v4_scope(addr: &Ipv4Addr) -> IpScope {
    let octets = addr.octets();
    // 100.64.0.0/10, carrier-grade NAT
    let is_cgnat = octets[0] == 100 && (64..128).contains(&octets[1]);
    if addr.is_private() || addr.is_loopback() || addr.is_link_local() || is_cgnat {
        IpScope::Private
    } else {
        IpScope::Public
    }
}

fn v6_scope(addr: &Ipv6Addr) -> IpScope {
    let segments = addr.segments();
    // fc00::/7, unique local addresses
    let is_ula = (segments[0] & 0xfe00) == 0xfc00;
    // fe80::/10, link-local
    let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
    if addr.is_loopback() || is_ula || is_link_local {
        IpScope::Private
    } else {
        IpScope::Public
    }
}
