//! Bidirectional byte relay between the client and the tunnel stream.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUF_SIZE: usize = 16 * 1024;

/// Copy bytes both ways between `a` and `b` until either side closes.
///
/// The first direction to reach EOF or fail ends the relay; both write
/// halves are then shut down and both streams dropped. The relay also ends
/// once no byte has moved in either direction for at least `idle`.
///
/// Returns `(a_to_b, b_to_a)` byte counts.
///
/// # Errors
/// * The I/O error that ended the first direction.
/// * `ErrorKind::TimedOut` when the relay sat idle.
/// * `ErrorKind::Interrupted` when `cancel` fires first.
pub async fn relay<A, B>(
    a: A,
    b: B,
    idle: Duration,
    cancel: CancellationToken,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "relay cancelled")),
        res = pump(&mut a_read, &mut b_write, &a_to_b) => res,
        res = pump(&mut b_read, &mut a_write, &b_to_a) => res,
        _ = idle_watch(idle, &a_to_b, &b_to_a) => {
            Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle"))
        }
    };

    // Best-effort close; a peer that already went away just sees the drop.
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    result.map(|()| (a_to_b.load(Ordering::Relaxed), b_to_a.load(Ordering::Relaxed)))
}

/// Copy `from` into `to` until EOF, counting bytes into `moved`.
async fn pump<R, W>(from: &mut R, to: &mut W, moved: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        to.flush().await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Resolves after a full `idle` period in which neither counter moved.
async fn idle_watch(idle: Duration, a_to_b: &AtomicU64, b_to_a: &AtomicU64) {
    let total = || a_to_b.load(Ordering::Relaxed) + b_to_a.load(Ordering::Relaxed);
    let mut last = total();
    loop {
        tokio::time::sleep(idle).await;
        let now = total();
        if now == last {
            return;
        }
        last = now;
    }
}

/// Errors that just mean the other side went away.
pub(crate) fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}
