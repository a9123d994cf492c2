//! Relay session: one per accepted client.
//!
//! ```text
//!  Init ──(resolver resolves, upstream dialed)──▶ Stream ──(EOF / error)──▶ Destroyed
//!    └──────────────────(EOF / error)───────────────────────────────────────▲
//! ```
//!
//! In `Init` everything the client sends is accumulated and shown to the
//! resolver. Once it resolves, the bytes it did not consume become the first
//! payload for the upstream and the session starts relaying in both
//! directions. Each direction writes straight through and parks whatever the
//! kernel refuses in its pending buffer; write interest is held exactly while
//! a pending buffer is non-empty.
//!
//! End of stream from either side ends the session at once. Bytes still
//! pending for the other side are discarded and counted in the close line.
//!
//! There is no idle timeout: a client that connects and sends nothing stays
//! in `Init` until it hangs up or the process shuts down.

use std::{
    io, mem,
    net::{SocketAddr, TcpStream},
    os::unix::io::{AsRawFd, RawFd},
};

use tracing::{debug, info, warn};

use crate::{
    connector::Connect,
    error::{Error, Result},
    event_loop::{Registry, Token},
    poller::{Event, Ready},
    proto::Destination,
    resolver::{Parse, Resolve},
};

mod buffer;

pub use self::buffer::{read_once, write_once, PendingBuffer};

/// Bytes read from a socket per readable event.
pub const READ_SIZE: usize = 24 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Stream,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Give up on a client whose header has not resolved after this many bytes.
    pub max_header_bytes: usize,
    /// Stop reading a side while the opposite direction has this much queued.
    /// `None` leaves buffering unbounded.
    pub max_pending_bytes: Option<usize>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 8 * 1024,
            max_pending_bytes: Some(1024 * 1024),
        }
    }
}

#[derive(Debug)]
struct Upstream {
    stream: TcpStream,
    destination: Destination,
    connected: bool,
}

pub struct Session {
    token: Token,
    peer: SocketAddr,
    stage: Stage,
    client: Option<TcpStream>,
    upstream: Option<Upstream>,
    resolver: Box<dyn Resolve>,
    header: Vec<u8>,
    to_client: PendingBuffer,
    to_upstream: PendingBuffer,
    limits: Limits,
    bytes_from_client: u64,
    bytes_from_upstream: u64,
    dropped_bytes: u64,
}

impl Session {
    /// Takes ownership of an accepted, non-blocking client socket and
    /// registers it for reading.
    pub fn open(
        registry: &mut Registry,
        token: Token,
        client: TcpStream,
        peer: SocketAddr,
        resolver: Box<dyn Resolve>,
        limits: Limits,
    ) -> Result<Self> {
        registry.register(client.as_raw_fd(), token, Ready::READABLE | Ready::ERROR)?;
        Ok(Self {
            token,
            peer,
            stage: Stage::Init,
            client: Some(client),
            upstream: None,
            resolver,
            header: Vec::new(),
            to_client: PendingBuffer::new(),
            to_upstream: PendingBuffer::new(),
            limits,
            bytes_from_client: 0,
            bytes_from_upstream: 0,
            dropped_bytes: 0,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_destroyed(&self) -> bool {
        self.stage == Stage::Destroyed
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.upstream.as_ref().map(|upstream| &upstream.destination)
    }

    pub fn client_fd(&self) -> Option<RawFd> {
        self.client.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn upstream_fd(&self) -> Option<RawFd> {
        self.upstream.as_ref().map(|upstream| upstream.stream.as_raw_fd())
    }

    pub fn pending_to_client(&self) -> &[u8] {
        self.to_client.as_slice()
    }

    pub fn pending_to_upstream(&self) -> &[u8] {
        self.to_upstream.as_slice()
    }

    /// Pending bytes discarded when the session was destroyed.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    fn side(&self, fd: RawFd) -> Option<Side> {
        if self.client_fd() == Some(fd) {
            Some(Side::Client)
        } else if self.upstream_fd() == Some(fd) {
            Some(Side::Upstream)
        } else {
            None
        }
    }

    /// Handles one readiness event. Failures end the session here; nothing
    /// propagates to the loop.
    pub fn handle_event(&mut self, registry: &mut Registry, connector: &dyn Connect, event: Event) {
        if self.is_destroyed() {
            debug_assert!(false, "event delivered to a destroyed session");
            warn!(fd = event.fd, token = self.token, "event for destroyed session");
            return;
        }
        if let Err(err) = self.on_event(registry, connector, event) {
            match err {
                Error::Io(ref err) => {
                    debug!(peer = %self.peer, error = %err, "relay i/o failed")
                }
                ref err => warn!(peer = %self.peer, error = %err, "closing session"),
            }
            self.destroy(registry);
        }
    }

    fn on_event(&mut self, registry: &mut Registry, connector: &dyn Connect, event: Event) -> Result<()> {
        let side = self.side(event.fd).ok_or(Error::UnknownDescriptor(event.fd))?;
        let ready = event.ready;

        if ready.contains(Ready::READABLE) {
            let open = match side {
                Side::Client => self.on_client_readable(registry, connector)?,
                Side::Upstream => self.on_upstream_readable()?,
            };
            if !open {
                debug!(peer = %self.peer, ?side, "peer closed");
                self.destroy(registry);
                return Ok(());
            }
        }

        if ready.contains(Ready::WRITABLE) {
            match side {
                Side::Client => self.on_client_writable()?,
                Side::Upstream => self.on_upstream_writable()?,
            }
        }

        // HANGUP next to READABLE is left to the read path, which sees EOF
        if ready.intersects(Ready::ERROR | Ready::INVALID)
            || (ready.contains(Ready::HANGUP) && !ready.contains(Ready::READABLE))
        {
            return Err(self.socket_failure(side));
        }

        self.sync_interest(registry)
    }

    /// Returns false once the client has closed its end.
    fn on_client_readable(&mut self, registry: &mut Registry, connector: &dyn Connect) -> Result<bool> {
        let Some(client) = self.client.as_mut() else {
            return Ok(false);
        };
        let mut chunk = [0_u8; READ_SIZE];
        let n = match read_once(client, &mut chunk)? {
            None => return Ok(true),
            Some(0) => return Ok(false),
            Some(n) => n,
        };
        self.bytes_from_client += n as u64;

        match self.stage {
            Stage::Init => {
                self.header.extend_from_slice(&chunk[..n]);
                self.resolve(registry, connector)?;
            }
            Stage::Stream => match self.upstream.as_mut() {
                Some(upstream) if upstream.connected => {
                    self.to_upstream.send(&mut upstream.stream, &chunk[..n])?;
                }
                _ => self.to_upstream.push(&chunk[..n]),
            },
            Stage::Destroyed => {}
        }
        Ok(true)
    }

    /// Returns false once the upstream has closed its end.
    fn on_upstream_readable(&mut self) -> Result<bool> {
        let (Some(upstream), Some(client)) = (self.upstream.as_mut(), self.client.as_mut()) else {
            return Ok(false);
        };
        let mut chunk = [0_u8; READ_SIZE];
        let n = match read_once(&mut upstream.stream, &mut chunk)? {
            None => return Ok(true),
            Some(0) => return Ok(false),
            Some(n) => n,
        };
        self.bytes_from_upstream += n as u64;
        self.to_client.send(client, &chunk[..n])?;
        Ok(true)
    }

    fn on_client_writable(&mut self) -> Result<()> {
        if let Some(client) = self.client.as_mut() {
            self.to_client.flush(client)?;
        }
        Ok(())
    }

    fn on_upstream_writable(&mut self) -> Result<()> {
        let Some(upstream) = self.upstream.as_mut() else {
            return Ok(());
        };
        if !upstream.connected {
            if let Some(source) = upstream.stream.take_error()? {
                return Err(Error::Connect {
                    destination: upstream.destination.clone(),
                    source,
                });
            }
            upstream.connected = true;
            info!(peer = %self.peer, destination = %upstream.destination, "upstream connected");
        }
        self.to_upstream.flush(&mut upstream.stream)?;
        Ok(())
    }

    /// Runs the resolver over everything accumulated so far. One read may
    /// carry several handshake steps, so it loops until the resolver stalls.
    fn resolve(&mut self, registry: &mut Registry, connector: &dyn Connect) -> Result<()> {
        loop {
            let parsed = match self.resolver.try_parse(&self.header) {
                Ok(parsed) => parsed,
                Err(err) => {
                    if let (Some(reply), Some(client)) = (err.reply(), self.client.as_mut()) {
                        // best effort, the session is going away either way
                        let _ = write_once(client, reply);
                    }
                    return Err(err.into());
                }
            };
            match parsed {
                Parse::Incomplete => {
                    if self.header.len() >= self.limits.max_header_bytes {
                        return Err(Error::HeaderTooLarge {
                            limit: self.limits.max_header_bytes,
                        });
                    }
                    return Ok(());
                }
                Parse::Negotiated { consumed, reply } => {
                    self.header.drain(..consumed);
                    self.reply(reply)?;
                }
                Parse::Resolved {
                    destination,
                    consumed,
                    reply,
                } => {
                    self.header.drain(..consumed);
                    if let Some(reply) = reply {
                        self.reply(reply)?;
                    }
                    return self.open_upstream(registry, connector, destination);
                }
            }
        }
    }

    fn reply(&mut self, reply: &[u8]) -> Result<()> {
        if let Some(client) = self.client.as_mut() {
            self.to_client.send(client, reply)?;
        }
        Ok(())
    }

    fn open_upstream(
        &mut self,
        registry: &mut Registry,
        connector: &dyn Connect,
        destination: Destination,
    ) -> Result<()> {
        let stream = match connector.connect_nonblocking(&destination) {
            Ok(stream) => stream,
            Err(source) => return Err(Error::Connect { destination, source }),
        };
        // writable means the connect finished, one way or the other
        registry.register(stream.as_raw_fd(), self.token, Ready::WRITABLE | Ready::ERROR)?;
        info!(
            peer = %self.peer,
            %destination,
            fd = stream.as_raw_fd(),
            "connecting upstream"
        );

        let payload = mem::take(&mut self.header);
        self.to_upstream.push(&payload);
        self.upstream = Some(Upstream {
            stream,
            destination,
            connected: false,
        });
        self.stage = Stage::Stream;
        Ok(())
    }

    fn socket_failure(&self, side: Side) -> Error {
        let stream = match side {
            Side::Client => self.client.as_ref(),
            Side::Upstream => self.upstream.as_ref().map(|upstream| &upstream.stream),
        };
        let source = stream
            .and_then(|stream| stream.take_error().ok().flatten())
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "socket hung up"));
        match (side, self.upstream.as_ref()) {
            (Side::Upstream, Some(upstream)) if !upstream.connected => Error::Connect {
                destination: upstream.destination.clone(),
                source,
            },
            _ => Error::Io(source),
        }
    }

    fn over_limit(&self, pending: &PendingBuffer) -> bool {
        self.limits
            .max_pending_bytes
            .is_some_and(|max| pending.len() >= max)
    }

    fn client_interest(&self) -> Ready {
        let mut interest = Ready::ERROR;
        if self.stage == Stage::Init || !self.over_limit(&self.to_upstream) {
            interest |= Ready::READABLE;
        }
        if !self.to_client.is_empty() {
            interest |= Ready::WRITABLE;
        }
        interest
    }

    fn upstream_interest(&self, upstream: &Upstream) -> Ready {
        if !upstream.connected {
            return Ready::WRITABLE | Ready::ERROR;
        }
        let mut interest = Ready::ERROR;
        if !self.over_limit(&self.to_client) {
            interest |= Ready::READABLE;
        }
        if !self.to_upstream.is_empty() {
            interest |= Ready::WRITABLE;
        }
        interest
    }

    fn sync_interest(&self, registry: &mut Registry) -> Result<()> {
        if let Some(client) = &self.client {
            registry.modify(client.as_raw_fd(), self.client_interest())?;
        }
        if let Some(upstream) = &self.upstream {
            registry.modify(upstream.stream.as_raw_fd(), self.upstream_interest(upstream))?;
        }
        Ok(())
    }

    /// True when every connected descriptor asks for WRITABLE exactly while
    /// its pending buffer holds bytes. A connecting upstream is exempt: it
    /// waits on WRITABLE for the connect result.
    pub fn write_interest_matches_pending(&self, registry: &Registry) -> bool {
        let matches = |fd: RawFd, pending: &PendingBuffer| {
            registry
                .interest(fd)
                .map(|interest| interest.contains(Ready::WRITABLE))
                == Some(!pending.is_empty())
        };
        let client = self
            .client
            .as_ref()
            .map_or(true, |client| matches(client.as_raw_fd(), &self.to_client));
        let upstream = match &self.upstream {
            Some(upstream) if upstream.connected => {
                matches(upstream.stream.as_raw_fd(), &self.to_upstream)
            }
            _ => true,
        };
        client && upstream
    }

    /// Deregisters and closes both sockets. Safe to call any number of times.
    pub fn destroy(&mut self, registry: &mut Registry) {
        if let Some(upstream) = self.upstream.take() {
            Self::release(registry, self.token, upstream.stream);
        }
        if let Some(client) = self.client.take() {
            Self::release(registry, self.token, client);
        }
        if self.stage != Stage::Destroyed {
            self.stage = Stage::Destroyed;
            let dropped_to_upstream = mem::take(&mut self.to_upstream).len();
            let dropped_to_client = mem::take(&mut self.to_client).len();
            self.dropped_bytes = (dropped_to_upstream + dropped_to_client) as u64;
            info!(
                peer = %self.peer,
                bytes_from_client = self.bytes_from_client,
                bytes_from_upstream = self.bytes_from_upstream,
                dropped_to_upstream,
                dropped_to_client,
                "session closed"
            );
        }
    }

    fn release(registry: &mut Registry, token: Token, stream: TcpStream) {
        let fd = stream.as_raw_fd();
        if registry.token(fd) == Some(token) {
            if let Err(err) = registry.deregister(fd) {
                debug!(fd, error = %err, "deregister failed");
            }
        }
        drop(stream);
    }
}
