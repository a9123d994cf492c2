//! Single-threaded dispatch over the readiness multiplexer.
//!
//! The loop never owns sockets. Whoever registers a descriptor keeps the
//! socket and gets a `&mut Registry` back on every event, which is all it
//! needs to change its own interest or leave the loop.

use std::{collections::HashMap, os::unix::io::RawFd, time::Duration};

use tracing::{debug, error, warn};

use crate::{
    error::{Error, Result},
    poller::{Backend, Event, Poller, Ready},
};

/// Identifies the owner of one or more registered descriptors.
pub type Token = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registration {
    token: Token,
    interest: Ready,
}

/// Descriptor table plus the multiplexer it mirrors. A descriptor is
/// registered at most once.
#[derive(Debug)]
pub struct Registry {
    poller: Poller,
    fds: HashMap<RawFd, Registration>,
}

impl Registry {
    pub fn new(poller: Poller) -> Self {
        Self {
            poller,
            fds: HashMap::new(),
        }
    }

    pub fn backend(&self) -> Backend {
        self.poller.backend()
    }

    pub fn register(&mut self, fd: RawFd, token: Token, interest: Ready) -> Result<()> {
        if self.fds.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }
        self.poller.register(fd, interest)?;
        self.fds.insert(fd, Registration { token, interest });
        debug!(fd, token, ?interest, "registered");
        Ok(())
    }

    /// Replaces the interest of `fd`. Asking for the current interest is free.
    pub fn modify(&mut self, fd: RawFd, interest: Ready) -> Result<()> {
        let registration = self.fds.get_mut(&fd).ok_or(Error::UnknownDescriptor(fd))?;
        if registration.interest == interest {
            return Ok(());
        }
        self.poller.modify(fd, interest)?;
        registration.interest = interest;
        debug!(fd, ?interest, "modified");
        Ok(())
    }

    pub fn deregister(&mut self, fd: RawFd) -> Result<()> {
        let registration = self.fds.remove(&fd).ok_or(Error::UnknownDescriptor(fd))?;
        debug!(fd, token = registration.token, "deregistered");
        self.poller.unregister(fd)?;
        Ok(())
    }

    pub fn token(&self, fd: RawFd) -> Option<Token> {
        self.fds.get(&fd).map(|registration| registration.token)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Ready> {
        self.fds.get(&fd).map(|registration| registration.interest)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.fds.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

/// Receives every event for the tokens it registered.
pub trait Dispatch {
    fn dispatch(&mut self, registry: &mut Registry, token: Token, event: Event) -> Result<()>;

    /// Checked once per cycle; `run` returns after the first cycle that sees true.
    fn is_stopped(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct EventLoop {
    registry: Registry,
    events: Vec<Event>,
    /// Each event paired with the token that owned its descriptor when the
    /// poll returned.
    batch: Vec<(Token, Event)>,
    timeout: Option<Duration>,
}

impl EventLoop {
    pub fn new(backend: Backend, timeout: Option<Duration>) -> Result<Self> {
        let poller = Poller::new(backend)?;
        debug!(backend = %poller.backend(), "using event model");
        Ok(Self {
            registry: Registry::new(poller),
            events: Vec::new(),
            batch: Vec::new(),
            timeout,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// One poll and the dispatch of everything it reported. Poll failures are
    /// logged and swallowed, as are handler failures: one bad descriptor never
    /// takes the loop down. Returns how many events reached a handler.
    ///
    /// An event is only delivered to the token that owned the descriptor when
    /// the poll returned. A handler earlier in the batch may close that
    /// descriptor, and the kernel may hand the same number to a new socket
    /// registered under another token before the old event is reached.
    pub fn run_once<D: Dispatch>(&mut self, dispatcher: &mut D) -> usize {
        if let Err(err) = self.registry.poller.poll(&mut self.events, self.timeout) {
            error!(error = %err, "poll failed");
            return 0;
        }

        self.batch.clear();
        for event in self.events.drain(..) {
            match self.registry.token(event.fd) {
                Some(token) => self.batch.push((token, event)),
                None => debug!(fd = event.fd, ready = ?event.ready, "dropping event for unregistered fd"),
            }
        }

        let mut dispatched = 0;
        for (token, event) in self.batch.drain(..) {
            if self.registry.token(event.fd) != Some(token) {
                debug!(fd = event.fd, token, ready = ?event.ready, "dropping stale event");
                continue;
            }
            dispatched += 1;
            if let Err(err) = dispatcher.dispatch(&mut self.registry, token, event) {
                warn!(fd = event.fd, token, error = %err, "handler failed");
            }
        }
        dispatched
    }

    pub fn run<D: Dispatch>(&mut self, dispatcher: &mut D) {
        while !dispatcher.is_stopped() {
            self.run_once(dispatcher);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::unix::{io::AsRawFd, net::UnixStream},
    };

    use super::*;

    fn event_loop() -> EventLoop {
        EventLoop::new(Backend::Auto, Some(Duration::from_millis(100))).unwrap()
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut event_loop = event_loop();
        let (a, _b) = UnixStream::pair().unwrap();
        let registry = event_loop.registry_mut();
        registry.register(a.as_raw_fd(), 1, Ready::READABLE).unwrap();
        assert!(matches!(
            registry.register(a.as_raw_fd(), 2, Ready::READABLE),
            Err(Error::AlreadyRegistered(_))
        ));
        assert_eq!(registry.token(a.as_raw_fd()), Some(1));
    }

    #[test]
    fn unknown_descriptor_is_an_error() {
        let mut event_loop = event_loop();
        let registry = event_loop.registry_mut();
        assert!(matches!(
            registry.deregister(12345),
            Err(Error::UnknownDescriptor(12345))
        ));
        assert!(matches!(
            registry.modify(12345, Ready::READABLE),
            Err(Error::UnknownDescriptor(12345))
        ));
    }

    #[test]
    fn modify_tracks_interest() {
        let mut event_loop = event_loop();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let registry = event_loop.registry_mut();
        registry.register(fd, 7, Ready::READABLE | Ready::ERROR).unwrap();
        registry
            .modify(fd, Ready::READABLE | Ready::WRITABLE | Ready::ERROR)
            .unwrap();
        assert_eq!(
            registry.interest(fd),
            Some(Ready::READABLE | Ready::WRITABLE | Ready::ERROR)
        );
        registry.deregister(fd).unwrap();
        assert!(!registry.is_registered(fd));
        assert!(registry.is_empty());
    }

    /// Echoes whatever arrives and closes on EOF.
    struct Echo {
        stream: UnixStream,
        events: usize,
        closed: bool,
        fail_next: bool,
    }

    impl Dispatch for Echo {
        fn dispatch(&mut self, registry: &mut Registry, _token: Token, event: Event) -> Result<()> {
            self.events += 1;
            if self.fail_next {
                self.fail_next = false;
                return Err(Error::UnknownDescriptor(-1));
            }
            if event.ready.contains(Ready::READABLE) {
                let mut buf = [0_u8; 64];
                let n = self.stream.read(&mut buf)?;
                if n == 0 {
                    registry.deregister(self.stream.as_raw_fd())?;
                    self.closed = true;
                    return Ok(());
                }
                self.stream.write_all(&buf[..n])?;
            }
            Ok(())
        }

        fn is_stopped(&self) -> bool {
            self.closed
        }
    }

    #[test]
    fn dispatches_until_the_handler_stops() {
        let mut event_loop = event_loop();
        let (a, mut b) = UnixStream::pair().unwrap();
        event_loop
            .registry_mut()
            .register(a.as_raw_fd(), 1, Ready::READABLE | Ready::ERROR)
            .unwrap();
        let mut echo = Echo {
            stream: a,
            events: 0,
            closed: false,
            fail_next: true,
        };

        b.write_all(b"hi").unwrap();
        // the failing dispatch is logged, not fatal, and the data is still there
        assert_eq!(event_loop.run_once(&mut echo), 1);
        assert_eq!(event_loop.run_once(&mut echo), 1);
        let mut buf = [0_u8; 2];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        b.shutdown(std::net::Shutdown::Write).unwrap();
        event_loop.run(&mut echo);
        assert!(echo.closed);
        assert!(event_loop.registry().is_empty());
    }

    /// Whichever of tokens 1 and 2 runs first closes the other's socket and
    /// registers a fresh, idle socket as token 3. The fresh socket usually
    /// takes over the closed descriptor number.
    struct Replacer {
        victims: HashMap<Token, UnixStream>,
        fresh: Vec<UnixStream>,
        seen: Vec<Token>,
    }

    impl Dispatch for Replacer {
        fn dispatch(&mut self, registry: &mut Registry, token: Token, _event: Event) -> Result<()> {
            self.seen.push(token);
            if token == 3 || !self.fresh.is_empty() {
                return Ok(());
            }
            let other = if token == 1 { 2 } else { 1 };
            let victim = self.victims.remove(&other).unwrap();
            registry.deregister(victim.as_raw_fd())?;
            drop(victim);

            let (fresh, peer) = UnixStream::pair().unwrap();
            registry.register(fresh.as_raw_fd(), 3, Ready::READABLE | Ready::ERROR)?;
            self.fresh.extend([fresh, peer]);
            Ok(())
        }
    }

    #[test]
    fn reused_descriptor_never_receives_the_previous_owners_event() {
        let mut event_loop = EventLoop::new(Backend::Auto, Some(Duration::from_secs(1))).unwrap();
        let mut victims = HashMap::new();
        let mut peers = Vec::new();
        for token in [1, 2] {
            let (a, mut b) = UnixStream::pair().unwrap();
            event_loop
                .registry_mut()
                .register(a.as_raw_fd(), token, Ready::READABLE | Ready::ERROR)
                .unwrap();
            b.write_all(b"x").unwrap();
            victims.insert(token, a);
            peers.push(b);
        }
        let mut replacer = Replacer {
            victims,
            fresh: Vec::new(),
            seen: Vec::new(),
        };

        assert_eq!(event_loop.run_once(&mut replacer), 1);
        assert_eq!(replacer.seen.len(), 1);
        assert!(!replacer.seen.contains(&3));
        assert_eq!(event_loop.registry().token(replacer.fresh[0].as_raw_fd()), Some(3));
    }

    #[test]
    fn idle_cycle_dispatches_nothing() {
        let mut event_loop = EventLoop::new(Backend::Auto, Some(Duration::ZERO)).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        event_loop
            .registry_mut()
            .register(a.as_raw_fd(), 1, Ready::READABLE)
            .unwrap();
        let mut echo = Echo {
            stream: a,
            events: 0,
            closed: false,
            fail_next: false,
        };
        assert_eq!(event_loop.run_once(&mut echo), 0);
        assert_eq!(echo.events, 0);
    }
}
