//! Bidirectional byte relay between two connected peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

const BUF_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Ends both directions once, whichever finishes first.
#[derive(Debug, Default)]
struct CloseGuard {
    closed: AtomicBool,
    token: CancellationToken,
}

impl CloseGuard {
    /// Returns true for the first caller only.
    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.token.cancel();
        }
        first
    }
}

/// Relay bytes between `a` and `b` until either side ends, then close both.
///
/// The `a → b` direction runs on a spawned task, `b → a` runs inline, so the
/// returned future completes only after both directions have stopped.
pub async fn pump<A, B>(a: A, b: B) -> PumpStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let guard = Arc::new(CloseGuard::default());

    let upstream = tokio::spawn(relay(a_read, b_write, Arc::clone(&guard), "a->b"));
    let b_to_a = relay(b_read, a_write, Arc::clone(&guard), "b->a").await;
    let a_to_b = upstream.await.unwrap_or_default();

    PumpStats { a_to_b, b_to_a }
}

async fn relay<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    guard: Arc<CloseGuard>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut copied = 0u64;
    loop {
        // Cancellation only ever interrupts the read, never a write.
        let n = tokio::select! {
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("pump {} read error: {}", direction, e);
                    break;
                }
            },
            _ = guard.token.cancelled() => break,
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            tracing::debug!("pump {} write error: {}", direction, e);
            break;
        }
        copied += n as u64;
    }

    if guard.close() {
        tracing::trace!("pump {} finished first, closing both sides", direction);
    }
    let _ = writer.shutdown().await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_both_directions() {
        let (client, a) = tokio::io::duplex(1024);
        let (b, target) = tokio::io::duplex(1024);

        let pump = tokio::spawn(pump(a, b));

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut target_r, mut target_w) = tokio::io::split(target);

        client_w.write_all(b"ping from client").await.unwrap();
        let mut buf = [0u8; 16];
        target_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping from client");

        target_w.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Ending one side tears down the other.
        client_w.shutdown().await.unwrap();
        let mut rest = Vec::new();
        target_r.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = pump.await.unwrap();
        assert_eq!(stats.a_to_b, 16);
        assert_eq!(stats.b_to_a, 4);

        let mut rest = Vec::new();
        client_r.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_pump_closes_when_b_drops() {
        let (client, a) = tokio::io::duplex(64);
        let (b, target) = tokio::io::duplex(64);

        let pump = tokio::spawn(pump(a, b));
        drop(target);

        let stats = pump.await.unwrap();
        assert_eq!(stats, PumpStats::default());

        let (mut client_r, _client_w) = tokio::io::split(client);
        let mut rest = Vec::new();
        client_r.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_close_guard_once() {
        let guard = CloseGuard::default();
        assert!(guard.close());
        assert!(!guard.close());
        assert!(guard.token.is_cancelled());
    }
}
