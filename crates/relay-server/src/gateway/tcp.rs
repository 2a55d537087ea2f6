//! Plain TCP relaying: two directional copy loops over a fixed buffer.
//!
//! Whichever direction finishes first (EOF or error) ends the relay; both
//! streams are dropped together so the other direction cannot linger.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Byte counts for one finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    /// Bytes copied from the accepted peer to the destination.
    pub upstream: u64,
    /// Bytes copied from the destination back to the peer.
    pub downstream: u64,
}

/// Copy from `reader` to `writer` until EOF or error, adding to `counter`.
async fn pump<R, W>(mut reader: R, mut writer: W, buffer_size: usize, counter: &mut u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!(error = %e, "relay write failed");
                    break;
                }
                *counter += n as u64;
            }
            Err(e) => {
                debug!(error = %e, "relay read failed");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Relay bytes between `peer` and `destination` until either side ends.
///
/// `pending` holds peer bytes that were read together with the routing
/// header; they are delivered to the destination first.
pub async fn relay<P, D>(peer: P, mut destination: D, pending: &[u8], buffer_size: usize) -> RelayTotals
where
    P: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let mut totals = RelayTotals::default();

    if !pending.is_empty() {
        if let Err(e) = destination.write_all(pending).await {
            debug!(error = %e, "failed to flush buffered header bytes");
            return totals;
        }
        totals.upstream += pending.len() as u64;
    }

    let (peer_read, peer_write) = tokio::io::split(peer);
    let (dest_read, dest_write) = tokio::io::split(destination);

    let mut up = 0u64;
    let mut down = 0u64;
    tokio::select! {
        _ = pump(peer_read, dest_write, buffer_size, &mut up) => {
            debug!("peer side finished");
        }
        _ = pump(dest_read, peer_write, buffer_size, &mut down) => {
            debug!("destination side finished");
        }
    }

    totals.upstream += up;
    totals.downstream += down;
    totals
}
