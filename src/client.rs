//! Blocking SOCKS5 client: no-auth greeting, CONNECT, then a plain stream.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
};

use tracing::debug;

use crate::proto::{self, Destination, ServerStatus};

mod sync_proto;

pub use self::sync_proto::{send_recv, Receivable, Sendable};

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub proxy_addr: SocketAddr,
    pub destination: Destination,
}

/// Connects to the proxy and asks it for `req.destination`. The returned
/// stream carries application bytes only.
pub fn connect(req: &ConnectRequest) -> io::Result<TcpStream> {
    let mut conn = TcpStream::connect(req.proxy_addr)?;
    conn.set_nodelay(true)?;
    socks_handshake(&mut conn, &req.destination)?;
    Ok(conn)
}

/// Runs the handshake over any byte stream.
pub fn socks_handshake<C: Read + Write>(conn: &mut C, destination: &Destination) -> io::Result<()> {
    let choice: proto::ServerAuthChoice =
        send_recv(conn, proto::ClientGreeting(vec![proto::AuthMethod::NoAuth]))?;
    debug!(?choice, "auth negotiated");
    if choice.0 != proto::AuthMethod::NoAuth {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("proxy chose unsupported auth method: {:?}", choice.0),
        ));
    }

    let resp: proto::ServerResponse = send_recv(
        conn,
        proto::ClientConnectionRequest {
            cmd: proto::ClientCommand::EstablishConnection,
            destination: destination.clone(),
        },
    )?;
    debug!(?resp, "connect reply");
    match resp.status {
        ServerStatus::RequestGranted => Ok(()),
        status => Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy rejected connect to {destination} with: {status:?}"),
        )),
    }
}
