use std::{
    io,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use super::{timeout_millis, Event, Ready, MAX_EVENTS};
use crate::sys::{cvt, try_libc};

/// Level-triggered epoll. ERROR and HANGUP are always reported by the kernel,
/// so asking for ERROR adds nothing to the mask.
pub struct Epoll {
    epfd: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = try_libc!(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) });
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: to_epoll(interest),
            u64: fd as u64,
        };
        try_libc!(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) });
        Ok(())
    }

    pub fn register(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Ready::empty())
    }

    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let n = match cvt!(unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                self.buf.len() as libc::c_int,
                timeout_millis(timeout),
            )
        }) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };

        for raw in &self.buf[..n] {
            let (bits, fd) = (raw.events, raw.u64);
            events.push(Event {
                fd: fd as RawFd,
                ready: from_epoll(bits),
            });
        }
        Ok(())
    }
}

fn to_epoll(interest: Ready) -> u32 {
    let mut bits = 0;
    if interest.contains(Ready::READABLE) {
        bits |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if interest.contains(Ready::WRITABLE) {
        bits |= libc::EPOLLOUT;
    }
    bits as u32
}

fn from_epoll(bits: u32) -> Ready {
    let bits = bits as libc::c_int;
    let mut ready = Ready::empty();
    if bits & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        ready |= Ready::READABLE;
    }
    if bits & libc::EPOLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if bits & libc::EPOLLERR != 0 {
        ready |= Ready::ERROR;
    }
    if bits & libc::EPOLLHUP != 0 {
        ready |= Ready::HANGUP;
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_translate_both_ways() {
        assert_eq!(to_epoll(Ready::ERROR), 0);
        assert_eq!(
            from_epoll(to_epoll(Ready::READABLE | Ready::WRITABLE)),
            Ready::READABLE | Ready::WRITABLE
        );
        assert_eq!(
            from_epoll((libc::EPOLLERR | libc::EPOLLHUP) as u32),
            Ready::ERROR | Ready::HANGUP
        );
    }
}
