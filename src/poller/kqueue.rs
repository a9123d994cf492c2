use std::{
    collections::HashMap,
    io, mem,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr,
    time::Duration,
};

use super::{Event, Ready, MAX_EVENTS};
use crate::sys::{cvt, try_libc};

/// kqueue with one READ and one WRITE filter per descriptor. Filters are
/// level-triggered unless EV_CLEAR is set, which it never is here.
pub struct Kqueue {
    kq: OwnedFd,
    filters: HashMap<RawFd, Ready>,
    buf: Vec<libc::kevent>,
}

// The raw `udata` pointer inside `libc::kevent` is never set.
unsafe impl Send for Kqueue {}

fn kevent(fd: RawFd, filter: Ready, flags: u16) -> libc::kevent {
    let mut event: libc::kevent = unsafe { mem::zeroed() };
    event.ident = fd as libc::uintptr_t;
    event.filter = if filter == Ready::READABLE {
        libc::EVFILT_READ
    } else {
        libc::EVFILT_WRITE
    };
    event.flags = flags as _;
    event
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = try_libc!(unsafe { libc::kqueue() });
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        let ret = try_libc!(unsafe { libc::fcntl(kq.as_raw_fd(), libc::F_GETFD) });
        try_libc!(unsafe { libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, ret | libc::FD_CLOEXEC) });
        Ok(Self {
            kq,
            filters: HashMap::new(),
            buf: vec![unsafe { mem::zeroed() }; MAX_EVENTS],
        })
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        try_libc!(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        });
        Ok(())
    }

    /// Moves `fd` from its current filter set to the one `interest` implies.
    fn update(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let current = self.filters.get(&fd).copied().unwrap_or_default();
        let wanted = interest & (Ready::READABLE | Ready::WRITABLE);
        let mut changes = Vec::with_capacity(2);
        for filter in [Ready::READABLE, Ready::WRITABLE] {
            match (current.contains(filter), wanted.contains(filter)) {
                (false, true) => changes.push(kevent(fd, filter, libc::EV_ADD as u16)),
                (true, false) => changes.push(kevent(fd, filter, libc::EV_DELETE as u16)),
                _ => {}
            }
        }
        self.apply(&changes)?;
        self.filters.insert(fd, wanted);
        Ok(())
    }

    pub fn register(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.filters.insert(fd, Ready::empty());
        self.update(fd, interest)
    }

    pub fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.update(fd, interest)
    }

    pub fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        let result = self.update(fd, Ready::empty());
        self.filters.remove(&fd);
        match result {
            // closing a descriptor already dropped its filters
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let ts = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as _,
        });
        let n = match cvt!(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.buf.as_mut_ptr(),
                self.buf.len() as _,
                ts.as_ref().map_or(ptr::null(), |ts| ts as *const libc::timespec),
            )
        }) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };

        // READ and WRITE filters for one descriptor arrive as separate entries
        let mut index: HashMap<RawFd, usize> = HashMap::with_capacity(n);
        for raw in &self.buf[..n] {
            let fd = raw.ident as RawFd;
            let mut ready = Ready::empty();
            if raw.filter == libc::EVFILT_READ {
                ready |= Ready::READABLE;
            } else if raw.filter == libc::EVFILT_WRITE {
                ready |= Ready::WRITABLE;
            }
            if raw.flags as u32 & libc::EV_EOF as u32 != 0 {
                ready |= Ready::HANGUP;
            }
            if raw.flags as u32 & libc::EV_ERROR as u32 != 0 {
                ready |= Ready::ERROR;
            }
            match index.get(&fd) {
                Some(&at) => events[at].ready |= ready,
                None => {
                    index.insert(fd, events.len());
                    events.push(Event { fd, ready });
                }
            }
        }
        Ok(())
    }
}
