//! Raw socket plumbing std does not expose: non-blocking connect, a listen
//! backlog of our choosing, and the self-pipe used to wake the event loop.

use std::{
    io, mem,
    net::{SocketAddr, TcpListener, TcpStream},
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

macro_rules! try_libc {
    ($e: expr) => {{
        let ret = $e;
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        ret
    }};
}

macro_rules! cvt {
    ($e:expr) => {{
        let ret = $e;
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }};
}

pub(crate) use {cvt, try_libc};

pub const LISTEN_BACKLOG: libc::c_int = 1024;

fn set_cloexec_nonblocking(fd: RawFd) -> io::Result<()> {
    let ret = try_libc!(unsafe { libc::fcntl(fd, libc::F_GETFD) });
    try_libc!(unsafe { libc::fcntl(fd, libc::F_SETFD, ret | libc::FD_CLOEXEC) });
    let ret = try_libc!(unsafe { libc::fcntl(fd, libc::F_GETFL) });
    try_libc!(unsafe { libc::fcntl(fd, libc::F_SETFL, ret | libc::O_NONBLOCK) });
    Ok(())
}

pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut pipefd = [0; 2];
    try_libc!(unsafe { libc::pipe(pipefd.as_mut_ptr()) });
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(pipefd[0]), OwnedFd::from_raw_fd(pipefd[1])) };
    set_cloexec_nonblocking(read.as_raw_fd())?;
    set_cloexec_nonblocking(write.as_raw_fd())?;
    Ok((read, write))
}

fn stream_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = try_libc!(unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) });
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec_nonblocking(fd.as_raw_fd())?;
    Ok(fd)
}

fn sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                ..unsafe { mem::zeroed() }
            };
            unsafe { (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in).write(sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
                ..unsafe { mem::zeroed() }
            };
            unsafe { (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6).write(sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Starts a TCP connect and returns without waiting for it. The socket turns
/// writable once the handshake completes or fails; `TcpStream::take_error`
/// tells the two apart.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let fd = stream_socket(&addr)?;
    let (storage, len) = sockaddr(&addr);
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if ret == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    let stream = TcpStream::from(fd);
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Non-blocking listening socket with SO_REUSEADDR and the given backlog.
pub fn listen(addr: SocketAddr, backlog: libc::c_int) -> io::Result<TcpListener> {
    let fd = stream_socket(&addr)?;
    let on: libc::c_int = 1;
    try_libc!(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    });
    let (storage, len) = sockaddr(&addr);
    try_libc!(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    });
    try_libc!(unsafe { libc::listen(fd.as_raw_fd(), backlog) });
    Ok(TcpListener::from(fd))
}

/// Writes one byte to a non-blocking pipe. A full pipe already guarantees a
/// pending wakeup, so would-block is success.
pub fn wake(fd: RawFd) -> io::Result<()> {
    let byte = 1_u8;
    match cvt!(unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) }) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(err) => Err(err),
    }
}

/// Empties a non-blocking pipe.
pub fn drain(fd: RawFd) -> io::Result<()> {
    let mut buf = [0_u8; 64];
    loop {
        match cvt!(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::Ipv4Addr,
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn listen_and_connect_nonblocking_on_loopback() {
        let listener = listen((Ipv4Addr::LOCALHOST, 0).into(), LISTEN_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut stream = connect_nonblocking(addr).unwrap();
        let accepted = loop {
            match listener.accept() {
                Ok((accepted, _)) => break accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(err) => panic!("accept: {err}"),
            }
        };

        // wait until the handshake settles before writing
        stream.set_nonblocking(false).unwrap();
        assert!(stream.take_error().unwrap().is_none());
        stream.write_all(b"ping").unwrap();

        let mut accepted = accepted;
        accepted.set_nonblocking(false).unwrap();
        let mut buf = [0_u8; 4];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn listener_is_nonblocking() {
        let listener = listen((Ipv4Addr::LOCALHOST, 0).into(), LISTEN_BACKLOG).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn pipe_wake_then_drain() {
        let (read, write) = pipe().unwrap();
        wake(write.as_raw_fd()).unwrap();
        wake(write.as_raw_fd()).unwrap();
        drain(read.as_raw_fd()).unwrap();

        let mut buf = [0_u8; 1];
        let ret = unsafe {
            libc::read(read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 1)
        };
        assert_eq!(ret, -1);
        assert_eq!(io::Error::last_os_error().kind(), io::ErrorKind::WouldBlock);
    }
}
