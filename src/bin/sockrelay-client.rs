use std::{io, net::SocketAddr, thread};

use anyhow::Context;
use clap::Parser;
use sockrelay::{client, proto::Address, proto::Destination};

/// Pipes stdin/stdout through a SOCKS5 proxy.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Proxy address, e.g. 127.0.0.1:1082
    proxy: SocketAddr,

    /// Destination host: IPv4, IPv6 or domain name
    host: String,

    /// Destination port
    port: u16,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let address: Address = args.host.parse().context("invalid destination host")?;
    let req = client::ConnectRequest {
        proxy_addr: args.proxy,
        destination: Destination::new(address, args.port),
    };
    let mut stream_in = client::connect(&req)
        .with_context(|| format!("failed to connect through {}", args.proxy))?;
    let mut stream_out = stream_in.try_clone()?;

    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        // stdin EOF closes our write half so the far end sees it too
        if io::copy(&mut stdin, &mut stream_out).is_ok() {
            let _ = stream_out.shutdown(std::net::Shutdown::Write);
        }
    });

    let mut stdout = io::stdout().lock();
    io::copy(&mut stream_in, &mut stdout)?;
    Ok(())
}
