//! Helpers around [Multiaddr] for the addresses our transports speak.
use std::net::{IpAddr, SocketAddr};

pub use multiaddr::{Multiaddr, Protocol};

use crate::Error;

/// Parse a peer address, rejecting the empty address.
pub fn parse_multiaddr(s: &str) -> Result<Multiaddr, Error> {
    let address: Multiaddr = s
        .parse()
        .map_err(|error| Error::InvalidMultiaddr(s.to_string(), error))?;

    if address.is_empty() {
        return Err(Error::InvalidMultiaddr(
            s.to_string(),
            multiaddr::Error::InvalidMultiaddr,
        ));
    }

    Ok(address)
}

/// `/ip4/../udp/..` or `/ip6/../udp/..` from a socket address.
pub fn udp_multiaddr(address: SocketAddr) -> Multiaddr {
    Multiaddr::from(address.ip()).with(Protocol::Udp(address.port()))
}

/// `/memory/..` address of an in-process endpoint of a [crate::rpc::MemoryNetwork].
pub fn memory_multiaddr(port: u64) -> Multiaddr {
    Multiaddr::empty().with(Protocol::Memory(port))
}

/// Returns the socket address if this is an ip + udp address.
pub fn udp_socket_addr(address: &Multiaddr) -> Option<SocketAddr> {
    let mut protocols = address.iter();

    let ip: IpAddr = match protocols.next()? {
        Protocol::Ip4(ip) => ip.into(),
        Protocol::Ip6(ip) => ip.into(),
        _ => return None,
    };

    match protocols.next()? {
        Protocol::Udp(port) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}

/// Returns the port if this is a `/memory/..` address.
pub fn memory_port(address: &Multiaddr) -> Option<u64> {
    let mut protocols = address.iter();

    match (protocols.next(), protocols.next()) {
        (Some(Protocol::Memory(port)), None) => Some(port),
        _ => None,
    }
}
