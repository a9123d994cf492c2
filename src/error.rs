use std::{io, os::unix::io::RawFd};

use thiserror::Error;

use crate::{poller::Backend, proto};

/// Malformed or unsupported connection header. Always ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("expected socks version {v}, got {0}", v = proto::SOCKS_VERSION)]
    BadVersion(u8),

    #[error("client offered no acceptable auth method")]
    NoAcceptableMethod,

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("expected reserved byte to be zero, got {0}")]
    BadReserved(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name")]
    InvalidDomain,

    #[error("invalid port")]
    InvalidPort,

    #[error("request header carries no absolute url")]
    NoUrl,
}

impl ProtocolError {
    /// Bytes owed to the client before hanging up, if the protocol defines any.
    pub fn reply(&self) -> Option<&'static [u8]> {
        match self {
            ProtocolError::NoAcceptableMethod => Some(&proto::AUTH_REJECTED),
            _ => None,
        }
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connect to {destination} failed: {source}")]
    Connect {
        destination: proto::Destination,
        #[source]
        source: io::Error,
    },

    #[error("connection header exceeded {limit} bytes without resolving")]
    HeaderTooLarge { limit: usize },

    #[error("descriptor {0} is not registered")]
    UnknownDescriptor(RawFd),

    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("readiness backend {0} is not available on this platform")]
    UnsupportedBackend(Backend),

    #[error("url pattern does not compile: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_value() {
        assert_eq!(
            ProtocolError::BadVersion(4).to_string(),
            "expected socks version 5, got 4"
        );
        assert_eq!(
            ProtocolError::UnsupportedAddressType(2).to_string(),
            "unsupported address type: 0x02"
        );
    }

    #[test]
    fn only_auth_refusal_carries_a_reply() {
        assert_eq!(
            ProtocolError::NoAcceptableMethod.reply(),
            Some(&proto::AUTH_REJECTED[..])
        );
        assert_eq!(ProtocolError::BadReserved(1).reply(), None);
    }
}
