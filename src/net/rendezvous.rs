use super::{Io, Listener};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

/// A hijacked client socket waiting for the TLS accept loop
pub struct PendingConnection {
    io: Box<dyn Io>,
    peer_addr: SocketAddr,
    authority: String,
}

impl PendingConnection {
    pub fn new<T: Io>(io: T, peer_addr: SocketAddr, authority: impl Into<String>) -> Self {
        Self {
            io: Box::new(io),
            peer_addr,
            authority: authority.into(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The `host:port` named in the CONNECT request
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("peer_addr", &self.peer_addr)
            .field("authority", &self.authority)
            .finish()
    }
}

impl AsyncRead for PendingConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PendingConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

/// Listener fed by [`push`](RendezvousListener::push) instead of a socket.
///
/// Many producers may push concurrently. Connections are delivered once each,
/// in push order, to whichever task is blocked in `accept`.
pub struct RendezvousListener {
    tx: mpsc::UnboundedSender<PendingConnection>,
    rx: Mutex<mpsc::UnboundedReceiver<PendingConnection>>,
    closed: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl RendezvousListener {
    /// `local_addr` is reported for logging only; nothing is bound
    pub fn new(local_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed,
            local_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Enqueue a connection. Fails once the listener is closed and the
    /// connection is dropped.
    pub fn push(&self, conn: PendingConnection) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ListenerClosed);
        }
        self.tx.send(conn).map_err(|_| Error::ListenerClosed)
    }
}

/// Refuse further sends and drop whatever is still queued
fn shut(rx: &mut mpsc::UnboundedReceiver<PendingConnection>) {
    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!("Dropped {} queued connections on close", dropped);
    }
}

#[async_trait]
impl Listener for RendezvousListener {
    type Io = PendingConnection;

    async fn accept(&self) -> Result<(PendingConnection, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        if *closed.borrow_and_update() {
            shut(&mut rx);
            return Err(Error::ListenerClosed);
        }

        tokio::select! {
            biased;
            _ = closed.changed() => {
                shut(&mut rx);
                Err(Error::ListenerClosed)
            }
            conn = rx.recv() => match conn {
                Some(conn) => {
                    let peer = conn.peer_addr();
                    Ok((conn, peer))
                }
                None => Err(Error::ListenerClosed),
            }
        }
    }

    /// Queued connections are dropped here, or by the `accept` currently
    /// holding the queue
    fn close(&self) {
        self.closed.send_replace(true);
        if let Ok(mut rx) = self.rx.try_lock() {
            shut(&mut rx);
        }
    }
}
