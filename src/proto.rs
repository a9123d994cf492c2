use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

pub const SOCKS_VERSION: u8 = 0x05;
pub const RESERVED: u8 = 0x00;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN_NAME: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const NO_ACCEPTABLE_METHODS: u8 = 0xff;

/// The only greeting most clients send: version 5, one method, no-auth.
pub const NO_AUTH_GREETING: [u8; 3] = [SOCKS_VERSION, 0x01, AuthMethod::NoAuth as u8];

/// Reply to a greeting that offered no-auth.
pub const NO_AUTH_CHOICE: [u8; 2] = [SOCKS_VERSION, AuthMethod::NoAuth as u8];

/// Reply to a greeting that did not offer no-auth.
pub const AUTH_REJECTED: [u8; 2] = [SOCKS_VERSION, NO_ACCEPTABLE_METHODS];

/// Fixed success reply sent once a CONNECT request is parsed. It does not echo
/// the real bound address; clients in the wild only look at the status byte.
pub const CONNECT_ACK: [u8; 10] = [
    SOCKS_VERSION,
    ServerStatus::RequestGranted as u8,
    RESERVED,
    ATYP_IPV4,
    0x00,
    0x00,
    0x00,
    0x00,
    0x10,
    0x10,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    GssApi = 0x01,
    UserPass = 0x02,
}

impl TryFrom<u8> for AuthMethod {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::NoAuth),
            0x01 => Ok(Self::GssApi),
            0x02 => Ok(Self::UserPass),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected AuthMethod: {value}"),
            )),
        }
    }
}

#[derive(Debug)]
pub struct ClientGreeting(pub Vec<AuthMethod>);

#[derive(Debug)]
pub struct ServerAuthChoice(pub AuthMethod);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientCommand {
    EstablishConnection = 0x01,
    EstablishPortBinding = 0x02,
    AssociateUdpPort = 0x03,
}

impl TryFrom<u8> for ClientCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::EstablishConnection),
            0x02 => Ok(Self::EstablishPortBinding),
            0x03 => Ok(Self::AssociateUdpPort),
            other => Err(other),
        }
    }
}

#[derive(Debug)]
pub struct ClientConnectionRequest {
    pub cmd: ClientCommand,
    pub destination: Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerStatus {
    RequestGranted = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefusedByDestinationHost = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl TryFrom<u8> for ServerStatus {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::RequestGranted),
            0x01 => Ok(Self::GeneralFailure),
            0x02 => Ok(Self::ConnectionNotAllowedByRuleset),
            0x03 => Ok(Self::NetworkUnreachable),
            0x04 => Ok(Self::HostUnreachable),
            0x05 => Ok(Self::ConnectionRefusedByDestinationHost),
            0x06 => Ok(Self::TtlExpired),
            0x07 => Ok(Self::CommandNotSupported),
            0x08 => Ok(Self::AddressTypeNotSupported),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected ServerStatus: {value}"),
            )),
        }
    }
}

#[derive(Debug)]
pub struct ServerResponse {
    pub status: ServerStatus,
    pub bound: Destination,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    DomainName(String),
    Ipv6(Ipv6Addr),
}

impl Address {
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ipv4(_) => ATYP_IPV4,
            Address::DomainName(_) => ATYP_DOMAIN_NAME,
            Address::Ipv6(_) => ATYP_IPV6,
        }
    }

    /// ATYP byte followed by the address body, as it appears on the wire.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.atyp()];
        match self {
            Address::Ipv4(addr) => buf.extend_from_slice(&addr.octets()),
            Address::DomainName(dn) => {
                buf.push(dn.len() as u8);
                buf.extend_from_slice(dn.as_bytes());
            }
            Address::Ipv6(addr) => buf.extend_from_slice(&addr.octets()),
        }
        buf
    }
}

impl FromStr for Address {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(v4) = s.parse::<Ipv4Addr>() {
            return Ok(Address::Ipv4(v4));
        }
        let unbracketed = s.trim_start_matches('[').trim_end_matches(']');
        if let Ok(v6) = unbracketed.parse::<Ipv6Addr>() {
            return Ok(Address::Ipv6(v6));
        }
        // must be a domain name
        if s.is_empty() || s.len() > u8::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid domain name length: {}", s.len()),
            ));
        }
        Ok(Address::DomainName(s.to_owned()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(addr) => write!(f, "{addr}"),
            Address::DomainName(dn) => f.write_str(dn),
            Address::Ipv6(addr) => write!(f, "[{addr}]"),
        }
    }
}

/// Where a relayed connection goes. Produced once per connection and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    /// The literal socket address, if the destination is not a domain name.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.address {
            Address::Ipv4(addr) => Some(SocketAddr::new((*addr).into(), self.port)),
            Address::Ipv6(addr) => Some(SocketAddr::new((*addr).into(), self.port)),
            Address::DomainName(_) => None,
        }
    }

    /// ATYP, address and big-endian port, as they appear in a request or reply.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buf = self.address.as_bytes();
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::new(Address::Ipv4(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => Self::new(Address::Ipv6(*v6.ip()), v6.port()),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_ack_is_bit_exact() {
        assert_eq!(
            CONNECT_ACK,
            [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x10, 0x10]
        );
        assert_eq!(NO_AUTH_GREETING, [0x05, 0x01, 0x00]);
        assert_eq!(NO_AUTH_CHOICE, [0x05, 0x00]);
    }

    #[test]
    fn destination_encodes_port_big_endian() {
        let dest = Destination::new(Address::Ipv4(Ipv4Addr::LOCALHOST), 8080);
        assert_eq!(dest.as_bytes(), [0x01, 0x7f, 0x00, 0x00, 0x01, 0x1f, 0x90]);

        let dest = Destination::new(Address::DomainName("a.io".into()), 443);
        assert_eq!(dest.as_bytes(), [0x03, 4, b'a', b'.', b'i', b'o', 0x01, 0xbb]);
    }

    #[test]
    fn address_from_str_picks_the_literal_kind() {
        assert_eq!(
            "10.0.0.1".parse::<Address>().unwrap(),
            Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            "[::1]".parse::<Address>().unwrap(),
            Address::Ipv6(Ipv6Addr::LOCALHOST)
        );
        assert_eq!(
            "example.com".parse::<Address>().unwrap(),
            Address::DomainName("example.com".into())
        );
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn destination_display_brackets_ipv6() {
        let dest = Destination::new(Address::Ipv6(Ipv6Addr::LOCALHOST), 1082);
        assert_eq!(dest.to_string(), "[::1]:1082");
        assert_eq!(
            dest.socket_addr(),
            Some("[::1]:1082".parse::<SocketAddr>().unwrap())
        );
    }
}
