//! One multiplexed UDP conversation: a dialed UDP socket and the task that
//! shuttles datagrams between it and the parent tunnel.

use super::registry::{FlowKey, TunnelRegistry};
use relay_core::{encode_reply, RelayError, RelayResult};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::debug;

/// Receive buffer for one datagram.
const DATAGRAM_BUFFER: usize = 64 * 1024;

/// Bind an ephemeral local socket of the destination's family and connect it.
pub(super) async fn dial(destination: SocketAddr) -> RelayResult<UdpSocket> {
    let local: SocketAddr = if destination.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(destination).await?;
    Ok(socket)
}

/// Everything a flow task owns.
pub(super) struct FlowTask {
    pub key: FlowKey,
    pub serial: u64,
    pub socket: UdpSocket,
    /// Payloads arriving from the tunnel.
    pub inbound: mpsc::Receiver<Vec<u8>>,
    /// The tunnel's outbound frame queue.
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub idle_timeout: Duration,
    pub registry: Arc<TunnelRegistry>,
}

impl FlowTask {
    /// Run until the socket fails, the flow idles out, or the tunnel goes
    /// away; then deregister.
    pub async fn run(mut self) {
        let result = self.shuttle().await;
        self.registry.remove_flow(&self.key, self.serial).await;
        match result {
            Ok(()) => debug!(flow = %self.key.flow, "flow ended with its tunnel"),
            Err(RelayError::Timeout) => debug!(flow = %self.key.flow, "flow idle, closing"),
            Err(e) => debug!(flow = %self.key.flow, error = %e, "flow closed"),
        }
    }

    async fn shuttle(&mut self) -> RelayResult<()> {
        let channel = self.key.flow.channel();
        let mut buf = vec![0u8; DATAGRAM_BUFFER];
        let idle = time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                received = self.socket.recv(&mut buf) => {
                    let n = received?;
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    if self.outbound.send(encode_reply(channel, &buf[..n])).await.is_err() {
                        return Ok(());
                    }
                }
                payload = self.inbound.recv() => {
                    let Some(payload) = payload else {
                        return Ok(());
                    };
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    time::timeout(self.idle_timeout, self.socket.send(&payload))
                        .await
                        .map_err(|_| RelayError::Timeout)??;
                }
                _ = &mut idle => return Err(RelayError::Timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::registry::TunnelKey;
    use relay_core::FlowId;

    async fn echo_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn dial_matches_address_family() {
        let target = echo_server().await;
        let socket = dial(target).await.unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
        assert_eq!(socket.peer_addr().unwrap(), target);
    }

    #[tokio::test]
    async fn datagrams_are_tagged_with_channel_id() {
        let target = echo_server().await;
        let registry = Arc::new(TunnelRegistry::new());
        let key = FlowKey {
            tunnel: TunnelKey {
                conn_id: 1,
                destination: target,
            },
            flow: FlowId::new([7; 6], [0x12, 0x34]),
        };
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let task = FlowTask {
            key,
            serial: 0,
            socket: dial(target).await.unwrap(),
            inbound: in_rx,
            outbound: out_tx,
            idle_timeout: Duration::from_secs(5),
            registry,
        };
        let handle = tokio::spawn(task.run());

        in_tx.send(b"abc".to_vec()).await.unwrap();
        let frame = time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, [0x12, 0x34, b'a', b'b', b'c']);

        // Dropping the tunnel side ends the flow.
        drop(in_tx);
        time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    struct Started {
        tx: mpsc::Sender<Vec<u8>>,
        _replies: mpsc::Receiver<Vec<u8>>,
        handle: tokio::task::JoinHandle<()>,
    }

    /// Start a real flow task for `key` through the registry.
    async fn start_registered(
        registry: &Arc<TunnelRegistry>,
        key: FlowKey,
        idle_timeout: Duration,
    ) -> Started {
        let socket = dial(key.tunnel.destination).await.unwrap();
        let (out_tx, out_rx) = mpsc::channel(8);
        let mut join = None;
        let tx = registry
            .start_flow(key, |serial| {
                let (tx, inbound) = mpsc::channel(8);
                let handle = tokio::spawn(
                    FlowTask {
                        key,
                        serial,
                        socket,
                        inbound,
                        outbound: out_tx,
                        idle_timeout,
                        registry: registry.clone(),
                    }
                    .run(),
                );
                let abort = handle.abort_handle();
                join = Some(handle);
                (tx, abort)
            })
            .await
            .unwrap();
        Started {
            tx,
            _replies: out_rx,
            handle: join.unwrap(),
        }
    }

    fn flow_key(tunnel: TunnelKey, channel: u8) -> FlowKey {
        FlowKey {
            tunnel,
            flow: FlowId::new([9; 6], [0, channel]),
        }
    }

    #[tokio::test]
    async fn ended_flow_deregisters_only_itself() {
        let live = echo_server().await;
        let dead = {
            let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            s.local_addr().unwrap()
        };
        let registry = Arc::new(TunnelRegistry::new());
        let tunnel = TunnelKey {
            conn_id: 1,
            destination: dead,
        };
        let sibling_tunnel = TunnelKey {
            conn_id: 1,
            destination: live,
        };
        registry.register_tunnel(tunnel).await;
        registry.register_tunnel(sibling_tunnel).await;

        let _sibling =
            start_registered(&registry, flow_key(sibling_tunnel, 2), Duration::from_secs(5)).await;
        let doomed =
            start_registered(&registry, flow_key(tunnel, 1), Duration::from_secs(5)).await;
        assert_eq!(registry.flow_count().await, 2);

        // Port unreachable comes back as a recv error.
        doomed.tx.send(b"ping".to_vec()).await.unwrap();
        time::timeout(Duration::from_secs(5), doomed.handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(registry.flow_count().await, 1);
        assert_eq!(registry.flows_in(&sibling_tunnel).await, 1);
        assert_eq!(registry.tunnel_count().await, 2);
        assert!(registry.flow_sender(&flow_key(tunnel, 1)).await.is_none());
    }

    #[tokio::test]
    async fn idle_flow_deregisters_after_deadline() {
        let target = echo_server().await;
        let registry = Arc::new(TunnelRegistry::new());
        let tunnel = TunnelKey {
            conn_id: 1,
            destination: target,
        };
        registry.register_tunnel(tunnel).await;

        let started =
            start_registered(&registry, flow_key(tunnel, 1), Duration::from_millis(100)).await;
        time::timeout(Duration::from_secs(5), started.handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(registry.flow_count().await, 0);
        assert_eq!(registry.tunnel_count().await, 1);
    }

    #[tokio::test]
    async fn idle_flow_closes_itself() {
        let target = echo_server().await;
        let (_in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let mut task = FlowTask {
            key: FlowKey {
                tunnel: TunnelKey {
                    conn_id: 1,
                    destination: target,
                },
                flow: FlowId::new([0; 6], [0, 1]),
            },
            serial: 0,
            socket: dial(target).await.unwrap(),
            inbound: in_rx,
            outbound: out_tx,
            idle_timeout: Duration::from_millis(100),
            registry: Arc::new(TunnelRegistry::new()),
        };
        let result = time::timeout(Duration::from_secs(5), task.shuttle())
            .await
            .unwrap();
        assert!(matches!(result, Err(RelayError::Timeout)));
    }
}
