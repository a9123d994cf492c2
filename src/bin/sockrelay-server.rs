use std::{net::IpAddr, thread, time::Duration};

use anyhow::Context;
use clap::Parser;
use sockrelay::{tokio_relay, Backend, Config, Limits, LogFormat, Mode, Runtime, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SOCKRELAY_LISTEN", default_value = "0.0.0.0")]
    listen: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "SOCKRELAY_PORT", default_value_t = sockrelay::config::DEFAULT_PORT)]
    port: u16,

    /// How the destination is read from a new connection
    #[arg(long, env = "SOCKRELAY_MODE", value_enum, default_value_t = Mode::Socks5)]
    mode: Mode,

    #[arg(long, env = "SOCKRELAY_RUNTIME", value_enum, default_value_t = Runtime::Reactor)]
    runtime: Runtime,

    /// Readiness backend for the reactor runtime
    #[arg(long, env = "SOCKRELAY_BACKEND", value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    /// Longest single wait of the readiness loop, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    poll_timeout_ms: u64,

    /// Give up on a connection whose header has not resolved after this many bytes
    #[arg(long, default_value_t = 8 * 1024)]
    max_header_bytes: usize,

    /// Stop reading a side while this many bytes wait for the other; 0 disables
    #[arg(long, default_value_t = 1024 * 1024)]
    max_pending_bytes: usize,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            listen: self.listen,
            port: self.port,
            mode: self.mode,
            runtime: self.runtime,
            backend: self.backend,
            poll_timeout: Some(Duration::from_millis(self.poll_timeout_ms)),
            limits: Limits {
                max_header_bytes: self.max_header_bytes,
                max_pending_bytes: (self.max_pending_bytes > 0).then_some(self.max_pending_bytes),
            },
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    let config = args.config();
    info!(runtime = %config.runtime, "starting");

    match config.runtime {
        Runtime::Reactor => run_reactor(&config),
        Runtime::Tokio => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?
            .block_on(tokio_relay::run(&config))
            .with_context(|| format!("relay on {} failed", config.listen_addr())),
    }
}

fn run_reactor(config: &Config) -> anyhow::Result<()> {
    let mut server = Server::bind(config)
        .with_context(|| format!("failed to start relay on {}", config.listen_addr()))?;

    let handle = server.shutdown_handle();
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if signals.block_on(tokio::signal::ctrl_c()).is_ok() {
                if let Err(err) = handle.shutdown() {
                    warn!(error = %err, "failed to wake the event loop");
                }
            }
        })
        .context("failed to spawn signal thread")?;

    server.run();
    Ok(())
}
