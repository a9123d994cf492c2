//! The same relay with one tokio task per client instead of the readiness
//! loop. Connections go through the same resolver strategies and get the same
//! replies; only the scheduling differs.

use std::{future::Future, net::SocketAddr};

use futures::future::TryFutureExt;
use tokio::{
    io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    error::{Error, Result},
    proto::Destination,
    resolver::{Mode, Parse, Resolve},
    session::{Limits, READ_SIZE},
};

/// Bytes relayed by a finished connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub from_client: u64,
    pub from_upstream: u64,
}

pub struct ClientStream {}

struct Negotiating {
    stream: TcpStream,
    resolver: Box<dyn Resolve>,
    max_header_bytes: usize,
}

struct Dialing {
    stream: TcpStream,
    destination: Destination,
    payload: Vec<u8>,
}

struct Relaying {
    stream: TcpStream,
    upstream: TcpStream,
    payload: Vec<u8>,
}

impl ClientStream {
    pub async fn handle(stream: TcpStream, resolver: Box<dyn Resolve>, limits: Limits) -> Result<RelayStats> {
        let state = Negotiating {
            stream,
            resolver,
            max_header_bytes: limits.max_header_bytes,
        };
        Self::negotiate(state)
            .and_then(Self::dial)
            .and_then(Self::relay)
            .await
    }

    /// Feeds the resolver until it names a destination, writing back every
    /// reply it asks for on the way.
    async fn negotiate(
        Negotiating {
            mut stream,
            mut resolver,
            max_header_bytes,
        }: Negotiating,
    ) -> Result<Dialing> {
        let mut header = Vec::new();
        let mut chunk = vec![0_u8; READ_SIZE];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            header.extend_from_slice(&chunk[..n]);

            loop {
                match resolver.try_parse(&header) {
                    Ok(Parse::Incomplete) => {
                        if header.len() >= max_header_bytes {
                            return Err(Error::HeaderTooLarge {
                                limit: max_header_bytes,
                            });
                        }
                        break;
                    }
                    Ok(Parse::Negotiated { consumed, reply }) => {
                        header.drain(..consumed);
                        stream.write_all(reply).await?;
                    }
                    Ok(Parse::Resolved {
                        destination,
                        consumed,
                        reply,
                    }) => {
                        header.drain(..consumed);
                        if let Some(reply) = reply {
                            stream.write_all(reply).await?;
                        }
                        return Ok(Dialing {
                            stream,
                            destination,
                            payload: header,
                        });
                    }
                    Err(err) => {
                        if let Some(reply) = err.reply() {
                            stream.write_all(reply).await?;
                        }
                        return Err(err.into());
                    }
                }
            }
        }
    }

    async fn dial(
        Dialing {
            stream,
            destination,
            payload,
        }: Dialing,
    ) -> Result<Relaying> {
        let upstream = match TcpStream::connect(destination.to_string()).await {
            Ok(upstream) => upstream,
            Err(source) => return Err(Error::Connect { destination, source }),
        };
        upstream.set_nodelay(true)?;
        info!(%destination, "upstream connected");
        Ok(Relaying {
            stream,
            upstream,
            payload,
        })
    }

    async fn relay(
        Relaying {
            mut stream,
            mut upstream,
            payload,
        }: Relaying,
    ) -> Result<RelayStats> {
        upstream.write_all(&payload).await?;
        let (from_client, from_upstream) = copy_bidirectional(&mut stream, &mut upstream).await?;
        Ok(RelayStats {
            from_client: from_client + payload.len() as u64,
            from_upstream,
        })
    }
}

/// Accepts until `shutdown` resolves. In-flight connections keep their tasks.
pub async fn serve(
    listener: TcpListener,
    mode: Mode,
    limits: Limits,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let resolvers = mode.factory()?;
    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            () = &mut shutdown => {
                info!("shutdown requested");
                return Ok(());
            }
        };
        spawn_session(stream, peer, resolvers.resolver(), limits);
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, resolver: Box<dyn Resolve>, limits: Limits) {
    let span = info_span!("session", %peer);
    tokio::spawn(
        async move {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(error = %err, "set_nodelay failed");
            }
            info!("accepted");
            match ClientStream::handle(stream, resolver, limits).await {
                Ok(stats) => info!(
                    bytes_from_client = stats.from_client,
                    bytes_from_upstream = stats.from_upstream,
                    "session closed"
                ),
                Err(Error::Io(err)) => debug!(error = %err, "session ended"),
                Err(err) => warn!(error = %err, "closing session"),
            }
        }
        .instrument(span),
    );
}

/// Binds `config.listen_addr()` and serves until ctrl-c.
pub async fn run(config: &Config) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %listener.local_addr()?, mode = %config.mode, "listening");
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    serve(listener, config.mode, config.limits, shutdown).await
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::proto;

    fn socks5() -> Box<dyn Resolve> {
        Mode::Socks5.factory().unwrap().resolver()
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn socks5_connect_relays_both_ways() {
        let upstream_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = upstream_listener.local_addr().unwrap().port().to_be_bytes();
        let (mut user, server_side) = pair().await;
        let task = tokio::spawn(ClientStream::handle(server_side, socks5(), Limits::default()));

        user.write_all(&proto::NO_AUTH_GREETING).await.unwrap();
        let mut choice = [0_u8; 2];
        user.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, proto::NO_AUTH_CHOICE);

        user.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]])
            .await
            .unwrap();
        user.write_all(b"ping").await.unwrap();
        let mut ack = [0_u8; 10];
        user.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, proto::CONNECT_ACK);

        let (mut upstream, _) = upstream_listener.accept().await.unwrap();
        let mut buf = [0_u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        upstream.write_all(b"pong").await.unwrap();
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(user);
        drop(upstream);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.from_upstream, 4);
    }

    #[tokio::test]
    async fn rejected_greeting_is_answered_then_closed() {
        let (mut user, server_side) = pair().await;
        let task = tokio::spawn(ClientStream::handle(server_side, socks5(), Limits::default()));
        user.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = Vec::new();
        user.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, proto::AUTH_REJECTED);
        assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn refused_connect_is_a_connect_error() {
        let closed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = closed.local_addr().unwrap().port().to_be_bytes();
        drop(closed);
        let (mut user, server_side) = pair().await;
        let task = tokio::spawn(ClientStream::handle(server_side, socks5(), Limits::default()));
        user.write_all(&proto::NO_AUTH_GREETING).await.unwrap();
        user.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]])
            .await
            .unwrap();
        assert!(matches!(task.await.unwrap(), Err(Error::Connect { .. })));
    }
}
