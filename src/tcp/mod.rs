//! Connection handling: the listener and the four VTP state machines.
//!
//! Every state machine is written against [`Transport`], so it runs over a
//! TCP socket, a Unix socket or an in-memory duplex pipe alike.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod broadcaster;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod subscriber;

/// Any byte stream a VTP session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A stream whose concrete type was erased by the listener.
pub type BoxedTransport = Box<dyn Transport>;

/// Remote end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Tcp(SocketAddr),
    Unix(String),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Tcp(addr) => write!(f, "{addr}"),
            Peer::Unix(path) => write!(f, "unix:{path}"),
        }
    }
}
