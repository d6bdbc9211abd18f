//! Idle connection watchdog
//!
//! hyper 0.14 only arms its header read timeout once the first bytes of a
//! request arrive, so a keep-alive client that goes silent between requests
//! would hold its connection forever. [`IdleWatch`] tracks the last time
//! bytes moved and how many requests are in flight; [`IdleWatch::expired`]
//! resolves once the connection has been quiet for the whole timeout.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Default for connections built without configuration
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct IdleWatch {
    timeout: Duration,
    started: Instant,
    // Milliseconds since `started`
    last_activity: AtomicU64,
    in_flight: AtomicUsize,
}

impl IdleWatch {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record that bytes moved
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    /// Mark a request in flight until the returned guard is dropped
    pub fn begin(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
        InFlight {
            watch: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Resolves once no request is in flight and nothing has moved for the
    /// timeout
    pub async fn expired(&self) {
        loop {
            let wait = if self.in_flight() > 0 {
                self.timeout
            } else {
                let idle = self.idle_for();
                if idle >= self.timeout {
                    return;
                }
                self.timeout - idle
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Guard returned by [`IdleWatch::begin`]
#[derive(Debug)]
pub struct InFlight {
    watch: Arc<IdleWatch>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.watch.touch();
        self.watch.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Stream wrapper that reports every completed read and write to an
/// [`IdleWatch`]
#[derive(Debug)]
pub struct IdleIo<T> {
    inner: T,
    watch: Arc<IdleWatch>,
}

impl<T> IdleIo<T> {
    pub fn new(inner: T, watch: Arc<IdleWatch>) -> Self {
        Self { inner, watch }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for IdleIo<T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if buf.filled().len() > before {
                this.watch.touch();
            }
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for IdleIo<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                this.watch.touch();
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
