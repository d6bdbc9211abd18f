//! Bidirectional byte relay between two connected streams

use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Byte counts for a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to destination
    pub upstream_bytes: u64,
    /// Destination to client
    pub downstream_bytes: u64,
    pub duration: Duration,
}

/// Copy `from` into `to` until EOF or error. `total` is updated as bytes go.
async fn pump<R, W>(from: &mut R, to: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        to.flush().await?;
        *total += n as u64;
    }
}

/// Relay bytes between `client` and `destination` in both directions.
///
/// When either direction ends (EOF or error) the other is stopped and both
/// write halves are shut down. Returns once both directions have stopped;
/// the streams are dropped, and so closed, on return.
pub async fn relay<A, B>(client: A, destination: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut dest_read, mut dest_write) = tokio::io::split(destination);

    let mut upstream_bytes = 0u64;
    let mut downstream_bytes = 0u64;

    {
        let upstream = pump(&mut client_read, &mut dest_write, &mut upstream_bytes);
        let downstream = pump(&mut dest_read, &mut client_write, &mut downstream_bytes);
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        tokio::select! {
            result = &mut upstream => {
                if let Err(e) = result {
                    debug!("Client side of relay ended: {}", e);
                }
            }
            result = &mut downstream => {
                if let Err(e) = result {
                    debug!("Destination side of relay ended: {}", e);
                }
            }
        }
        // The unfinished direction is dropped here
    }

    let _ = dest_write.shutdown().await;
    let _ = client_write.shutdown().await;

    RelayStats {
        upstream_bytes,
        downstream_bytes,
        duration: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_bytes_pass_both_ways() {
        let (client, mut client_peer) = duplex(1024);
        let (destination, mut dest_peer) = duplex(1024);

        let relay_task = tokio::spawn(relay(client, destination));

        client_peer.write_all(b"hello destination").await.unwrap();
        let mut buf = [0u8; 17];
        dest_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello destination");

        dest_peer.write_all(b"hello client").await.unwrap();
        let mut buf = [0u8; 12];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        drop(client_peer);
        let stats = timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.upstream_bytes, 17);
        assert_eq!(stats.downstream_bytes, 12);
    }

    #[tokio::test]
    async fn test_closing_one_side_closes_other() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client_peer = TcpStream::connect(addr).await.unwrap();
        let (client, _) = listener.accept().await.unwrap();
        let mut dest_peer = TcpStream::connect(addr).await.unwrap();
        let (destination, _) = listener.accept().await.unwrap();

        let relay_task = tokio::spawn(relay(client, destination));

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client_peer.write_all(&payload).await.unwrap();
        let mut received = vec![0u8; payload.len()];
        dest_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        drop(client_peer);

        // Destination observes EOF within a bounded delay
        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(5), dest_peer.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let stats = timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.upstream_bytes, payload.len() as u64);
    }
}
