//! Listener plus the handler table the event loop dispatches into.

use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    os::unix::io::{AsRawFd, OwnedFd, RawFd},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    config::Config,
    connector::{Connect, DirectConnector},
    error::{Error, Result},
    event_loop::{Dispatch, EventLoop, Registry, Token},
    poller::{Event, Ready},
    resolver::ResolverFactory,
    session::{Limits, Session},
    sys,
};

const LISTENER: Token = 0;
const WAKER: Token = 1;
const FIRST_SESSION: Token = 2;

/// Everything the loop can hand an event to.
enum Handler {
    Listener(TcpListener),
    Waker(OwnedFd),
    Session(Session),
}

/// Stops a running [`Server`] from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    waker: Arc<OwnedFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        sys::wake(self.waker.as_raw_fd())
    }
}

struct Relay {
    handlers: HashMap<Token, Handler>,
    next_token: Token,
    resolvers: ResolverFactory,
    limits: Limits,
    connector: Box<dyn Connect>,
    stopped: bool,
}

impl Relay {
    fn next_token(&mut self) -> Token {
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.checked_add(1).unwrap_or(FIRST_SESSION);
            if !self.handlers.contains_key(&token) {
                return token;
            }
        }
    }

    /// Accepts exactly one connection; level-triggered readiness brings us
    /// back for the rest of the backlog.
    fn accept(&mut self, registry: &mut Registry) -> Result<()> {
        let Some(Handler::Listener(listener)) = self.handlers.get(&LISTENER) else {
            return Ok(());
        };
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        self.open_session(registry, stream, peer)
    }

    fn open_session(&mut self, registry: &mut Registry, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let token = self.next_token();
        info!(%peer, fd = stream.as_raw_fd(), token, "accepted");
        let session = Session::open(registry, token, stream, peer, self.resolvers.resolver(), self.limits)?;
        self.handlers.insert(token, Handler::Session(session));
        Ok(())
    }

    /// Destroys every session and drops the listener and waker.
    fn sweep(&mut self, registry: &mut Registry) {
        let sessions = self
            .handlers
            .values()
            .filter(|handler| matches!(handler, Handler::Session(_)))
            .count();
        if sessions > 0 {
            info!(sessions, "closing live sessions");
        }
        for (_, handler) in self.handlers.drain() {
            match handler {
                Handler::Session(mut session) => session.destroy(registry),
                Handler::Listener(listener) => release(registry, listener.as_raw_fd()),
                Handler::Waker(fd) => release(registry, fd.as_raw_fd()),
            }
        }
        self.stopped = true;
    }
}

fn release(registry: &mut Registry, fd: RawFd) {
    if let Err(err) = registry.deregister(fd) {
        debug!(fd, error = %err, "deregister failed");
    }
}

impl Dispatch for Relay {
    fn dispatch(&mut self, registry: &mut Registry, token: Token, event: Event) -> Result<()> {
        match self.handlers.get_mut(&token) {
            None => Err(Error::UnknownDescriptor(event.fd)),
            Some(Handler::Listener(_)) => self.accept(registry),
            Some(Handler::Waker(waker)) => {
                sys::drain(waker.as_raw_fd())?;
                info!("shutdown requested");
                self.stopped = true;
                Ok(())
            }
            Some(Handler::Session(session)) => {
                session.handle_event(registry, self.connector.as_ref(), event);
                if session.is_destroyed() {
                    self.handlers.remove(&token);
                } else {
                    debug_assert!(session.write_interest_matches_pending(registry));
                }
                Ok(())
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// The readiness-loop relay: a listening socket, the sessions it spawned and
/// the loop that drives them, all on the calling thread.
pub struct Server {
    event_loop: EventLoop,
    relay: Relay,
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
}

impl Server {
    pub fn bind(config: &Config) -> Result<Self> {
        Self::with_connector(config, Box::new(DirectConnector))
    }

    pub fn with_connector(config: &Config, connector: Box<dyn Connect>) -> Result<Self> {
        let resolvers = config.mode.factory()?;
        let mut event_loop = EventLoop::new(config.backend, config.poll_timeout)?;
        let listener = sys::listen(config.listen_addr(), sys::LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;
        let (waker_rx, waker_tx) = sys::pipe()?;

        let registry = event_loop.registry_mut();
        registry.register(listener.as_raw_fd(), LISTENER, Ready::READABLE | Ready::ERROR)?;
        registry.register(waker_rx.as_raw_fd(), WAKER, Ready::READABLE)?;

        let mut handlers = HashMap::new();
        handlers.insert(LISTENER, Handler::Listener(listener));
        handlers.insert(WAKER, Handler::Waker(waker_rx));

        info!(
            addr = %local_addr,
            mode = %config.mode,
            backend = %event_loop.registry().backend(),
            "listening"
        );
        Ok(Self {
            event_loop,
            relay: Relay {
                handlers,
                next_token: FIRST_SESSION,
                resolvers,
                limits: config.limits,
                connector,
                stopped: false,
            },
            local_addr,
            shutdown: ShutdownHandle {
                waker: Arc::new(waker_tx),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serves until a [`ShutdownHandle`] fires, then sweeps.
    pub fn run(&mut self) {
        self.event_loop.run(&mut self.relay);
        self.shutdown();
    }

    /// One poll cycle. Returns how many events were dispatched.
    pub fn run_once(&mut self) -> usize {
        self.event_loop.run_once(&mut self.relay)
    }

    /// Closes every session and the listener. The server accepts nothing
    /// afterwards.
    pub fn shutdown(&mut self) {
        self.relay.sweep(self.event_loop.registry_mut());
        if !self.event_loop.registry().is_empty() {
            warn!(
                remaining = self.event_loop.registry().len(),
                "descriptors left registered after shutdown"
            );
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.relay.stopped
    }

    pub fn session_count(&self) -> usize {
        self.relay
            .handlers
            .values()
            .filter(|handler| matches!(handler, Handler::Session(_)))
            .count()
    }

    /// Descriptors currently in the registration table, listener and waker
    /// included.
    pub fn registered(&self) -> usize {
        self.event_loop.registry().len()
    }
}
