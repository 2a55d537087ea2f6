//! UDP-over-TCP tunnels.
//!
//! A TCP connection that asked for `udp` becomes a tunnel. The connection
//! task reads frames and routes each one to the flow named by its flow id,
//! dialing a new UDP socket the first time an id is seen. Flow tasks push
//! replies into the tunnel's outbound queue, which a single writer task
//! drains onto the TCP connection.

use super::flow::{self, FlowTask};
use super::registry::{FlowKey, TunnelKey, TunnelRegistry};
use super::ConnectionId;
use crate::gateway::resolver::Destination;
use relay_core::{decode_frame, RelayError, RelayResult, MAX_DATAGRAM_LEN};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

/// Frames queued towards the client before flow tasks start waiting.
const OUTBOUND_QUEUE: usize = 256;
/// Datagrams queued towards one UDP socket before new ones are dropped.
const FLOW_QUEUE: usize = 64;

/// Runs UDP tunnels on behalf of the connection gate.
pub struct UdpMultiplexer {
    registry: Arc<TunnelRegistry>,
    idle_timeout: Duration,
    /// Size of one TCP read, and therefore the largest accepted frame.
    frame_buffer: usize,
}

impl UdpMultiplexer {
    pub fn new(registry: Arc<TunnelRegistry>, idle_timeout: Duration, frame_buffer: usize) -> Self {
        Self {
            registry,
            idle_timeout,
            frame_buffer,
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Run a tunnel over `stream` until the connection ends.
    ///
    /// `pending` is data that arrived together with the routing header; it is
    /// treated as the first frame. On return the tunnel is deregistered and
    /// every flow it owned has been stopped.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Protocol`] for a frame shorter than a flow id.
    /// - [`RelayError::Timeout`] when the client stays silent past the idle
    ///   deadline or a write stalls past it.
    /// - [`RelayError::Io`] / [`RelayError::Transport`] for connection failures.
    pub async fn serve<S>(
        &self,
        conn_id: ConnectionId,
        destination: &Destination,
        stream: S,
        pending: Vec<u8>,
    ) -> RelayResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let key = TunnelKey {
            conn_id,
            destination: destination.addr,
        };
        if !self.registry.register_tunnel(key).await {
            return Err(RelayError::Transport(format!(
                "tunnel already registered for connection {conn_id} to {destination}"
            )));
        }
        debug!(conn_id, destination = %destination, "tunnel opened");

        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let mut write_task = tokio::spawn(write_frames(writer, outbound_rx, self.idle_timeout));

        let result = self
            .read_frames(&key, reader, pending, &outbound_tx, &mut write_task)
            .await;

        if let Some(teardown) = self.registry.remove_tunnel(&key).await {
            debug!(
                conn_id,
                destination = %destination,
                flows = teardown.flows,
                lifetime_ms = teardown.lifetime.as_millis() as u64,
                "tunnel closed"
            );
        }
        write_task.abort();
        result
    }

    /// Decode loop: one TCP read is one frame.
    async fn read_frames<R>(
        &self,
        key: &TunnelKey,
        mut reader: R,
        pending: Vec<u8>,
        outbound: &mpsc::Sender<Vec<u8>>,
        write_task: &mut JoinHandle<RelayResult<()>>,
    ) -> RelayResult<()>
    where
        R: AsyncRead + Unpin,
    {
        if !pending.is_empty() {
            self.route_frame(key, &pending, outbound).await?;
        }

        let mut buf = vec![0u8; self.frame_buffer];
        loop {
            let n = tokio::select! {
                read = time::timeout(self.idle_timeout, reader.read(&mut buf)) => {
                    match read.map_err(|_| RelayError::Timeout)?? {
                        0 => return Ok(()),
                        n => n,
                    }
                }
                written = &mut *write_task => {
                    return match written {
                        Ok(Ok(())) => Err(RelayError::Transport("tunnel writer stopped".into())),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(RelayError::Transport(format!("tunnel writer failed: {e}"))),
                    };
                }
            };
            self.route_frame(key, &buf[..n], outbound).await?;
        }
    }

    /// Deliver one client frame to its flow, creating the flow if needed.
    ///
    /// Only a malformed frame is fatal to the tunnel; anything that goes wrong
    /// with a single flow stays with that flow.
    async fn route_frame(
        &self,
        key: &TunnelKey,
        frame: &[u8],
        outbound: &mpsc::Sender<Vec<u8>>,
    ) -> RelayResult<()> {
        let (flow_id, payload) = decode_frame(frame)?;
        let flow_key = FlowKey {
            tunnel: *key,
            flow: flow_id,
        };

        if payload.len() > MAX_DATAGRAM_LEN {
            debug!(flow = %flow_id, len = payload.len(), "oversized datagram, closing flow");
            self.registry.close_flow(&flow_key).await;
            return Ok(());
        }

        let tx = match self.registry.flow_sender(&flow_key).await {
            Some(tx) => tx,
            None => match self.open_flow(flow_key, outbound).await {
                Ok(tx) => tx,
                Err(e) => {
                    debug!(flow = %flow_id, destination = %key.destination, error = %e, "unable to open flow");
                    return Ok(());
                }
            },
        };

        match tx.try_send(payload.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(flow = %flow_id, "flow queue full, dropping datagram");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(flow = %flow_id, "flow closed before delivery");
            }
        }
        Ok(())
    }

    /// Dial a UDP socket for a new flow and start its task.
    async fn open_flow(
        &self,
        key: FlowKey,
        outbound: &mpsc::Sender<Vec<u8>>,
    ) -> RelayResult<mpsc::Sender<Vec<u8>>> {
        let socket = flow::dial(key.tunnel.destination).await?;
        debug!(
            flow = %key.flow,
            local = ?socket.local_addr().ok(),
            destination = %key.tunnel.destination,
            "flow opened"
        );

        let outbound = outbound.clone();
        let registry = self.registry.clone();
        let idle_timeout = self.idle_timeout;
        self.registry
            .start_flow(key, move |serial| {
                let (tx, inbound) = mpsc::channel(FLOW_QUEUE);
                let task = FlowTask {
                    key,
                    serial,
                    socket,
                    inbound,
                    outbound,
                    idle_timeout,
                    registry,
                };
                let handle = tokio::spawn(task.run());
                (tx, handle.abort_handle())
            })
            .await
            .ok_or_else(|| RelayError::Transport("tunnel is closing".into()))
    }
}

/// Drain the outbound queue onto the client connection, one frame per write.
async fn write_frames<W>(
    mut writer: W,
    mut frames: mpsc::Receiver<Vec<u8>>,
    idle_timeout: Duration,
) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        time::timeout(idle_timeout, writer.write_all(&frame))
            .await
            .map_err(|_| RelayError::Timeout)??;
    }
    Ok(())
}
