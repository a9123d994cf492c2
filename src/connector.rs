use std::{
    io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
};

use tracing::debug;

use crate::{proto::Destination, sys};

/// Opens the outbound leg of a relay. Implementations must return at once with
/// a non-blocking socket; the connect may still be in flight and is reported
/// through the first writable event on the returned stream.
pub trait Connect: Send {
    fn connect_nonblocking(&self, destination: &Destination) -> io::Result<TcpStream>;
}

/// Resolves the destination with the system resolver and dials the first
/// address it returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectConnector;

impl DirectConnector {
    fn resolve(destination: &Destination) -> io::Result<SocketAddr> {
        if let Some(addr) = destination.socket_addr() {
            return Ok(addr);
        }
        (destination.address.to_string(), destination.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {destination}"),
                )
            })
    }
}

impl Connect for DirectConnector {
    fn connect_nonblocking(&self, destination: &Destination) -> io::Result<TcpStream> {
        let addr = Self::resolve(destination)?;
        debug!(%destination, %addr, "dialing");
        sys::connect_nonblocking(addr)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::proto::Address;

    #[test]
    fn literal_destinations_skip_the_system_resolver() {
        let dest = Destination::new(Address::Ipv4(Ipv4Addr::new(192, 0, 2, 1)), 9);
        assert_eq!(
            DirectConnector::resolve(&dest).unwrap(),
            "192.0.2.1:9".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn localhost_resolves() {
        let dest = Destination::new(Address::DomainName("localhost".into()), 80);
        let addr = DirectConnector::resolve(&dest).unwrap();
        assert_eq!(addr.port(), 80);
        assert!(addr.ip().is_loopback());
    }
}
