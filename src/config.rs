use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{
    poller::{Backend, TIMEOUT_PRECISION},
    resolver::Mode,
    session::Limits,
};

pub const DEFAULT_PORT: u16 = 1082;

/// Which engine drives the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Runtime {
    /// Single-threaded readiness loop.
    #[default]
    Reactor,
    /// One tokio task per connection.
    Tokio,
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Runtime::Reactor => "reactor",
            Runtime::Tokio => "tokio",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: IpAddr,
    pub port: u16,
    pub mode: Mode,
    pub runtime: Runtime,
    pub backend: Backend,
    /// `None` lets the multiplexer block until something is ready.
    pub poll_timeout: Option<Duration>,
    pub limits: Limits,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            mode: Mode::Socks5,
            runtime: Runtime::default(),
            backend: Backend::Auto,
            poll_timeout: Some(TIMEOUT_PRECISION),
            limits: Limits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_every_interface() {
        let config = Config::default();
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:1082");
        assert_eq!(config.poll_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.limits.max_header_bytes, 8192);
        assert_eq!(config.limits.max_pending_bytes, Some(1 << 20));
    }
}
