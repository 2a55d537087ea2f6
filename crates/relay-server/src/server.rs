//! Core server: accepts TCP connections and hands each one to the gate.

use crate::config::ServerConfig;
use crate::gateway::{
    AddressFilter, AdmissionStats, ConnectionGate, DnsResolver, GateOutcome, GateSettings,
};
use crate::mux::{ConnectionId, TunnelRegistry, UdpMultiplexer};
use relay_core::{RelayError, RelayResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    gate: Arc<ConnectionGate<DnsResolver>>,
}

impl RelayServer {
    /// Build the address filter, tunnel registry and gate from `config`.
    pub fn new(config: ServerConfig) -> RelayResult<Self> {
        let filter = AddressFilter::from_lists(&config.source_allow, &config.destination_deny)?;
        let (allow, deny) = filter.sizes();
        info!(
            source_allow = allow,
            destination_deny = deny,
            "address filter loaded"
        );

        let mux = UdpMultiplexer::new(
            Arc::new(TunnelRegistry::new()),
            config.idle_timeout,
            config.udp_frame_buffer,
        );
        let gate = ConnectionGate::new(
            filter,
            DnsResolver,
            Arc::new(AdmissionStats::new()),
            mux,
            GateSettings::from_config(&config),
        );

        Ok(Self {
            config,
            gate: Arc::new(gate),
        })
    }

    pub fn stats(&self) -> &Arc<AdmissionStats> {
        self.gate.stats()
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        self.gate.multiplexer().registry()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> RelayResult<()> {
        let listener = TcpListener::bind(self.config.bind).await.map_err(|e| {
            RelayError::Transport(format!("failed to bind {}: {e}", self.config.bind))
        })?;
        info!(addr = %listener.local_addr()?, "relay listening");
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> RelayResult<()> {
        let mut next_conn_id: ConnectionId = 1;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            if !self.gate.admit(peer) {
                drop(stream);
                continue;
            }

            let conn_id = next_conn_id;
            next_conn_id += 1;
            let gate = self.gate.clone();
            tokio::spawn(async move {
                match gate.handle(conn_id, peer, stream).await {
                    Ok(GateOutcome::Relayed(totals)) => debug!(
                        conn_id,
                        upstream = totals.upstream,
                        downstream = totals.downstream,
                        "tcp relay finished"
                    ),
                    Ok(GateOutcome::Tunneled) => debug!(conn_id, "udp tunnel closed"),
                    Err(e) if is_routine_close(&e) => {
                        debug!(conn_id, peer = %peer, error = %e, "connection closed");
                    }
                    Err(e) => warn!(conn_id, peer = %peer, error = %e, "connection failed"),
                }
            });
        }
    }
}

/// Errors a peer can cause on its own: refused admission, malformed input,
/// unreachable destinations and ordinary disconnects.
fn is_routine_close(e: &RelayError) -> bool {
    e.is_teardown()
        || matches!(
            e,
            RelayError::AdmissionDenied(_)
                | RelayError::Protocol(_)
                | RelayError::Resolve(_)
                | RelayError::Transport(_)
        )
}
