//! Listener abstraction shared by the CONNECT ingress and the TLS terminator

pub mod idle;
pub mod rendezvous;

pub use idle::{IdleIo, IdleWatch, InFlight};
pub use rendezvous::{PendingConnection, RendezvousListener};

use crate::error::{Error, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::debug;

/// A byte stream a listener can hand out
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Source of inbound connections.
///
/// Once `close` has been called, blocked and future `accept` calls return
/// [`Error::ListenerClosed`].
#[async_trait]
pub trait Listener: Send + Sync {
    type Io: Io;

    async fn accept(&self) -> Result<(Self::Io, SocketAddr)>;

    fn close(&self);
}

/// Listener over a bound TCP socket
pub struct TcpAcceptor {
    listener: TcpListener,
    closed: watch::Sender<bool>,
}

impl TcpAcceptor {
    /// Bind with SO_REUSEADDR so a restart does not wait out TIME_WAIT
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener = TcpListener::from_std(socket.into())?;
        debug!("Bound TCP listener on {}", addr);

        Ok(Self::from_listener(listener))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        let (closed, _) = watch::channel(false);
        Self { listener, closed }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    type Io = TcpStream;

    async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::ListenerClosed);
        }

        tokio::select! {
            biased;
            _ = closed.changed() => Err(Error::ListenerClosed),
            accepted = self.listener.accept() => {
                let (stream, peer) = accepted?;
                let _ = stream.set_nodelay(true);
                Ok((stream, peer))
            }
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}
