//! Readiness multiplexer.
//!
//! One contract, `register`/`modify`/`unregister`/`poll`, over whichever
//! readiness mechanism the platform offers. Every backend is level-triggered:
//! a descriptor keeps being reported for as long as the condition holds, so a
//! caller that no longer wants write-readiness must drop WRITABLE with
//! `modify` or the loop spins.

use std::{fmt, io, os::unix::io::RawFd, time::Duration};

use bitflags::bitflags;

use crate::error::{Error, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
mod poll;

/// Upper bound on events returned by one `poll` call.
pub const MAX_EVENTS: usize = 1024;

/// Default `poll` timeout. Only bounds how stale periodic housekeeping can get.
pub const TIMEOUT_PRECISION: Duration = Duration::from_secs(10);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Ready: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERROR = 1 << 2;
        const HANGUP = 1 << 3;
        const INVALID = 1 << 4;
    }
}

impl Ready {
    /// The flags a caller may ask for. HANGUP and INVALID are only ever reported.
    pub const INTEREST: Ready = Ready::READABLE.union(Ready::WRITABLE).union(Ready::ERROR);

    pub fn is_valid_interest(self) -> bool {
        Ready::INTEREST.contains(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub ready: Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// epoll on Linux, kqueue on the BSDs and macOS, poll(2) elsewhere.
    Auto,
    Epoll,
    Kqueue,
    Poll,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Auto => "auto",
            Backend::Epoll => "epoll",
            Backend::Kqueue => "kqueue",
            Backend::Poll => "poll",
        })
    }
}

pub enum Poller {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::Epoll),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(kqueue::Kqueue),
    Poll(poll::PollSet),
}

impl Poller {
    /// Creates the requested backend. Failing here is fatal for the process.
    pub fn new(backend: Backend) -> Result<Self> {
        match backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Auto | Backend::Epoll => Ok(Poller::Epoll(epoll::Epoll::new()?)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Auto | Backend::Kqueue => Ok(Poller::Kqueue(kqueue::Kqueue::new()?)),
            Backend::Poll => Ok(Poller::Poll(poll::PollSet::new())),
            #[allow(unreachable_patterns)]
            Backend::Auto => Ok(Poller::Poll(poll::PollSet::new())),
            #[allow(unreachable_patterns)]
            other => Err(Error::UnsupportedBackend(other)),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(_) => Backend::Epoll,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(_) => Backend::Kqueue,
            Poller::Poll(_) => Backend::Poll,
        }
    }

    pub fn register(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        check_interest(interest)?;
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.register(fd, interest),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.register(fd, interest),
            Poller::Poll(p) => p.register(fd, interest),
        }
    }

    /// Replaces the interest set of an already registered descriptor.
    pub fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        check_interest(interest)?;
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.modify(fd, interest),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.modify(fd, interest),
            Poller::Poll(p) => p.modify(fd, interest),
        }
    }

    pub fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.unregister(fd),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.unregister(fd),
            Poller::Poll(p) => p.unregister(fd),
        }
    }

    /// Waits for readiness and replaces the contents of `events` with what was
    /// observed, one entry per descriptor. `None` blocks until something is
    /// ready, `Some(Duration::ZERO)` returns immediately. An interrupted wait
    /// yields no events rather than an error.
    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.poll(events, timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.poll(events, timeout),
            Poller::Poll(p) => p.poll(events, timeout),
        }
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Poller").field(&self.backend()).finish()
    }
}

fn check_interest(interest: Ready) -> io::Result<()> {
    if interest.is_valid_interest() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot register interest in {interest:?}"),
        ))
    }
}

/// Milliseconds for the C wait calls: -1 blocks, partial milliseconds round
/// up so a short timeout never turns into a busy poll.
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
