use std::net::{Ipv4Addr, Ipv6Addr};

use super::{Parse, Resolve};
use crate::{
    error::ProtocolError,
    proto::{self, Address, ClientCommand, Destination},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForGreeting,
    WaitingForConnectRequest,
}

/// SOCKS5 no-auth handshake: `VER NMETHODS METHODS...`, answered with
/// `05 00`, then `VER CMD RSV ATYP ADDR PORT`, answered with the fixed
/// CONNECT acknowledgement.
#[derive(Debug)]
pub struct Socks5Resolver {
    state: State,
}

impl Socks5Resolver {
    pub fn new() -> Self {
        Self {
            state: State::WaitingForGreeting,
        }
    }
}

impl Default for Socks5Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolve for Socks5Resolver {
    fn try_parse(&mut self, buf: &[u8]) -> Result<Parse, ProtocolError> {
        match self.state {
            State::WaitingForGreeting => match read_greeting(buf)? {
                None => Ok(Parse::Incomplete),
                Some(consumed) => {
                    self.state = State::WaitingForConnectRequest;
                    Ok(Parse::Negotiated {
                        consumed,
                        reply: &proto::NO_AUTH_CHOICE,
                    })
                }
            },
            State::WaitingForConnectRequest => match read_connect_request(buf)? {
                None => Ok(Parse::Incomplete),
                Some((destination, consumed)) => Ok(Parse::Resolved {
                    destination,
                    consumed,
                    reply: Some(&proto::CONNECT_ACK),
                }),
            },
        }
    }
}

fn check_version(version: u8) -> Result<(), ProtocolError> {
    if version != proto::SOCKS_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }
    Ok(())
}

/// Length of a complete greeting offering no-auth, `None` while truncated.
fn read_greeting(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(&version) = buf.first() else {
        return Ok(None);
    };
    check_version(version)?;

    let Some(&nauth) = buf.get(1) else {
        return Ok(None);
    };
    let len = 2 + nauth as usize;
    let Some(methods) = buf.get(2..len) else {
        return Ok(None);
    };
    if !methods.contains(&(proto::AuthMethod::NoAuth as u8)) {
        return Err(ProtocolError::NoAcceptableMethod);
    }
    Ok(Some(len))
}

/// Destination and header length of a complete CONNECT request. Each field is
/// validated as soon as it has arrived, so garbage is rejected without waiting
/// for the rest of the header.
fn read_connect_request(buf: &[u8]) -> Result<Option<(Destination, usize)>, ProtocolError> {
    let Some(&version) = buf.first() else {
        return Ok(None);
    };
    check_version(version)?;

    let Some(&cmd) = buf.get(1) else {
        return Ok(None);
    };
    match ClientCommand::try_from(cmd) {
        Ok(ClientCommand::EstablishConnection) => {}
        Ok(other) => return Err(ProtocolError::UnsupportedCommand(other as u8)),
        Err(unknown) => return Err(ProtocolError::UnsupportedCommand(unknown)),
    }

    let Some(&reserved) = buf.get(2) else {
        return Ok(None);
    };
    if reserved != proto::RESERVED {
        return Err(ProtocolError::BadReserved(reserved));
    }

    let Some((address, addr_end)) = read_address(buf, 3)? else {
        return Ok(None);
    };
    let Some(port) = buf.get(addr_end..addr_end + 2) else {
        return Ok(None);
    };
    let port = u16::from_be_bytes([port[0], port[1]]);
    if port == 0 {
        return Err(ProtocolError::InvalidPort);
    }

    Ok(Some((Destination::new(address, port), addr_end + 2)))
}

/// Address starting with its ATYP byte at `at`, plus the offset just past it.
fn read_address(buf: &[u8], at: usize) -> Result<Option<(Address, usize)>, ProtocolError> {
    let Some(&atyp) = buf.get(at) else {
        return Ok(None);
    };
    let body = at + 1;
    match atyp {
        proto::ATYP_IPV4 => Ok(buf.get(body..body + 4).map(|octets| {
            let addr = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            (Address::Ipv4(addr), body + 4)
        })),
        proto::ATYP_DOMAIN_NAME => {
            let Some(&dn_len) = buf.get(body) else {
                return Ok(None);
            };
            if dn_len == 0 {
                return Err(ProtocolError::InvalidDomain);
            }
            let start = body + 1;
            let end = start + dn_len as usize;
            let Some(dn) = buf.get(start..end) else {
                return Ok(None);
            };
            let dn = std::str::from_utf8(dn).map_err(|_| ProtocolError::InvalidDomain)?;
            Ok(Some((Address::DomainName(dn.to_owned()), end)))
        }
        proto::ATYP_IPV6 => Ok(buf.get(body..body + 16).map(|octets| {
            let mut addr = [0_u8; 16];
            addr.copy_from_slice(octets);
            (Address::Ipv6(Ipv6Addr::from(addr)), body + 16)
        })),
        other => Err(ProtocolError::UnsupportedAddressType(other)),
    }
}
