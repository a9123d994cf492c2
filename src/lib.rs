//! A TCP relay that learns each connection's destination from its first bytes
//! (a SOCKS5 CONNECT handshake, or an absolute URL in an HTTP request) and
//! then pipes bytes both ways.
//!
//! The default engine is a single-threaded, level-triggered readiness loop
//! ([`Server`]); [`tokio_relay`] runs the same relay with one task per
//! connection.

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod event_loop;
pub mod poller;
pub mod proto;
pub mod resolver;
pub mod server;
pub mod session;
pub mod tokio_relay;

mod sys;

pub use crate::{
    config::{Config, LogFormat, Runtime},
    connector::{Connect, DirectConnector},
    error::{Error, ProtocolError, Result},
    poller::Backend,
    resolver::Mode,
    server::{Server, ShutdownHandle},
    session::Limits,
};
