//! Conversions between `std::net` and smoltcp address types.

use std::net::{IpAddr, SocketAddr};

use smoltcp::wire::{IpAddress, IpEndpoint};

pub(crate) fn to_smol(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

pub(crate) fn from_smol(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6),
    }
}

pub(crate) fn to_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(to_smol(addr.ip()), addr.port())
}

pub(crate) fn from_endpoint(ep: IpEndpoint) -> SocketAddr {
    SocketAddr::new(from_smol(ep.addr), ep.port)
}
