//! Destination extraction from the first bytes of a connection.
//!
//! A strategy is handed everything the client has sent that was not consumed
//! yet and reports how far it got. The caller owns the buffer: it drops the
//! consumed prefix, writes any reply back to the client, and forwards whatever
//! is left after resolution as payload.

use std::fmt;

use crate::{error::ProtocolError, proto::Destination};

mod http;
mod socks5;

pub use self::{http::HttpResolver, socks5::Socks5Resolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse {
    /// More bytes are needed before anything can be decided.
    Incomplete,
    /// A handshake step completed without naming a destination yet.
    Negotiated {
        consumed: usize,
        reply: &'static [u8],
    },
    Resolved {
        destination: Destination,
        consumed: usize,
        reply: Option<&'static [u8]>,
    },
}

pub trait Resolve: Send {
    fn try_parse(&mut self, buf: &[u8]) -> Result<Parse, ProtocolError>;
}

/// Which strategy new connections get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// SOCKS5 no-auth handshake followed by a CONNECT request.
    Socks5,
    /// Scan for an absolute `http://host[:port]/` URL in the request.
    Http,
}

impl Mode {
    /// Builds whatever the strategy needs up front, so a bad pattern fails
    /// startup rather than a connection.
    pub fn factory(self) -> Result<ResolverFactory, regex::Error> {
        Ok(match self {
            Mode::Socks5 => ResolverFactory::Socks5,
            Mode::Http => ResolverFactory::Http(HttpResolver::new()?),
        })
    }
}

/// Hands every new connection a fresh strategy.
#[derive(Debug, Clone)]
pub enum ResolverFactory {
    Socks5,
    Http(HttpResolver),
}

impl ResolverFactory {
    pub fn resolver(&self) -> Box<dyn Resolve> {
        match self {
            ResolverFactory::Socks5 => Box::new(Socks5Resolver::new()),
            ResolverFactory::Http(http) => Box::new(http.clone()),
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            ResolverFactory::Socks5 => Mode::Socks5,
            ResolverFactory::Http(_) => Mode::Http,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Socks5 => "socks5",
            Mode::Http => "http",
        })
    }
}
