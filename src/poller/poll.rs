use std::{collections::HashMap, io, os::unix::io::RawFd, time::Duration};

use super::{timeout_millis, Event, Ready};
use crate::sys::cvt;

/// Portable descriptor-set poller over poll(2). POLLERR, POLLHUP and POLLNVAL
/// are reported whether asked for or not.
#[derive(Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, fd: RawFd) -> io::Result<usize> {
        self.index.get(&fd).copied().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("fd {fd} is not in the poll set"),
            )
        })
    }

    pub fn register(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        if self.index.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {fd} is already in the poll set"),
            ));
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: to_poll(interest),
            revents: 0,
        });
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let slot = self.slot(fd)?;
        self.fds[slot].events = to_poll(interest);
        Ok(())
    }

    pub fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        let slot = self.slot(fd)?;
        self.index.remove(&fd);
        self.fds.swap_remove(slot);
        if let Some(moved) = self.fds.get(slot) {
            self.index.insert(moved.fd, slot);
        }
        Ok(())
    }

    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let n = match cvt!(unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        }) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(());
        }

        for pollfd in &self.fds {
            if pollfd.revents != 0 {
                events.push(Event {
                    fd: pollfd.fd,
                    ready: from_poll(pollfd.revents),
                });
            }
        }
        Ok(())
    }
}

fn to_poll(interest: Ready) -> libc::c_short {
    let mut bits = 0;
    if interest.contains(Ready::READABLE) {
        bits |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.contains(Ready::WRITABLE) {
        bits |= libc::POLLOUT;
    }
    bits
}

fn from_poll(bits: libc::c_short) -> Ready {
    let mut ready = Ready::empty();
    if bits & (libc::POLLIN | libc::POLLPRI) != 0 {
        ready |= Ready::READABLE;
    }
    if bits & libc::POLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if bits & libc::POLLERR != 0 {
        ready |= Ready::ERROR;
    }
    if bits & libc::POLLHUP != 0 {
        ready |= Ready::HANGUP;
    }
    if bits & libc::POLLNVAL != 0 {
        ready |= Ready::INVALID;
    }
    ready
}
