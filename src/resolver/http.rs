use std::net::{Ipv4Addr, Ipv6Addr};

use regex::bytes::{Captures, Regex};

use super::{Parse, Resolve};
use crate::{
    error::ProtocolError,
    proto::{Address, Destination},
};

const DEFAULT_PORT: u16 = 80;
const HEADER_END: &[u8] = b"\r\n\r\n";

// The authority must be followed by a delimiter, otherwise a URL cut in half
// by a packet boundary would resolve to a truncated host or port.
const ABSOLUTE_URL: &str = r"(?i-u)https?://(?:\[([0-9a-f:.]+)\]|([^\s/:?#\[\]]+))(?::([0-9]+))?[/?#\s]";

/// Finds the first `http(s)://host[:port]` in the request. Nothing is
/// consumed: the request itself is the first payload sent upstream.
///
/// Clones share the compiled pattern, so one instance is built at startup and
/// cloned per connection.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    url: Regex,
}

impl HttpResolver {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            url: Regex::new(ABSOLUTE_URL)?,
        })
    }
}

impl Resolve for HttpResolver {
    fn try_parse(&mut self, buf: &[u8]) -> Result<Parse, ProtocolError> {
        match self.url.captures(buf) {
            Some(captures) => Ok(Parse::Resolved {
                destination: destination(&captures)?,
                consumed: 0,
                reply: None,
            }),
            None if buf.windows(HEADER_END.len()).any(|w| w == HEADER_END) => {
                Err(ProtocolError::NoUrl)
            }
            None => Ok(Parse::Incomplete),
        }
    }
}

fn destination(captures: &Captures<'_>) -> Result<Destination, ProtocolError> {
    let address = if let Some(v6) = captures.get(1) {
        let v6 = std::str::from_utf8(v6.as_bytes()).map_err(|_| ProtocolError::InvalidDomain)?;
        Address::Ipv6(v6.parse::<Ipv6Addr>().map_err(|_| ProtocolError::InvalidDomain)?)
    } else {
        let host = captures.get(2).ok_or(ProtocolError::InvalidDomain)?;
        let host = std::str::from_utf8(host.as_bytes()).map_err(|_| ProtocolError::InvalidDomain)?;
        match host.parse::<Ipv4Addr>() {
            Ok(v4) => Address::Ipv4(v4),
            Err(_) if host.len() <= u8::MAX as usize => Address::DomainName(host.to_owned()),
            Err(_) => return Err(ProtocolError::InvalidDomain),
        }
    };

    let port = match captures.get(3) {
        None => DEFAULT_PORT,
        Some(port) => std::str::from_utf8(port.as_bytes())
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .filter(|port| *port != 0)
            .ok_or(ProtocolError::InvalidPort)?,
    };

    Ok(Destination::new(address, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(buf: &[u8]) -> Result<Parse, ProtocolError> {
        HttpResolver::new().unwrap().try_parse(buf)
    }

    fn resolved(buf: &[u8]) -> Destination {
        match resolve(buf).unwrap() {
            Parse::Resolved {
                destination,
                consumed,
                reply,
            } => {
                assert_eq!(consumed, 0);
                assert_eq!(reply, None);
                destination
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn extracts_host_and_port_from_request_line() {
        let dest = resolved(b"GET http://example.com:8080/path HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(dest.address, Address::DomainName("example.com".into()));
        assert_eq!(dest.port, 8080);
    }

    #[test]
    fn port_defaults_to_80() {
        assert_eq!(resolved(b"GET http://example.com/ HTTP/1.1\r\n").port, 80);
        assert_eq!(resolved(b"GET https://example.com/ HTTP/1.1\r\n").port, 80);
        assert_eq!(resolved(b"GET http://example.com HTTP/1.1\r\n").port, 80);
    }

    #[test]
    fn literal_hosts() {
        assert_eq!(
            resolved(b"GET http://127.0.0.1:8080/ HTTP/1.1\r\n").address,
            Address::Ipv4(Ipv4Addr::LOCALHOST)
        );
        let dest = resolved(b"GET http://[::1]:9000/x HTTP/1.1\r\n");
        assert_eq!(dest.address, Address::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(dest.port, 9000);
    }

    #[test]
    fn url_cut_by_a_packet_boundary_is_incomplete() {
        assert_eq!(resolve(b"GET http://exam").unwrap(), Parse::Incomplete);
        assert_eq!(resolve(b"GET http://example.com:80").unwrap(), Parse::Incomplete);
        assert_eq!(resolve(b"GET ").unwrap(), Parse::Incomplete);
    }

    #[test]
    fn complete_header_without_url_is_an_error() {
        assert_eq!(
            resolve(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap_err(),
            ProtocolError::NoUrl
        );
    }

    #[test]
    fn out_of_range_port_is_an_error() {
        assert_eq!(
            resolve(b"GET http://example.com:70000/ HTTP/1.1\r\n").unwrap_err(),
            ProtocolError::InvalidPort
        );
        assert_eq!(
            resolve(b"GET http://example.com:0/ HTTP/1.1\r\n").unwrap_err(),
            ProtocolError::InvalidPort
        );
    }

    #[test]
    fn tolerates_binary_noise_before_the_url() {
        let mut buf = vec![0xff, 0x00, 0xfe];
        buf.extend_from_slice(b" GET HTTP://Example.com:81/ HTTP/1.0\r\n");
        let dest = resolved(&buf);
        assert_eq!(dest.to_string(), "Example.com:81");
    }

    #[test]
    fn clones_resolve_independently() {
        let shared = HttpResolver::new().unwrap();
        let mut first = shared.clone();
        let mut second = shared.clone();
        assert_eq!(first.try_parse(b"GET http://a").unwrap(), Parse::Incomplete);
        assert!(matches!(
            second.try_parse(b"GET http://b.example/ HTTP/1.1\r\n").unwrap(),
            Parse::Resolved { .. }
        ));
        assert!(matches!(
            first.try_parse(b"GET http://a.example/ HTTP/1.1\r\n").unwrap(),
            Parse::Resolved { .. }
        ));
    }
}
