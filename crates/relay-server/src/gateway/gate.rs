//! Connection gate: the per-connection path from accept to dispatch.
//!
//! ```text
//! ACCEPTED → admit (source allow-list)
//!   → HEADER_READ (bounded, up to the first CR)
//!   → HEADER_PARSE
//!   → DESTINATION_CHECK (resolve, destination deny-list)
//!   → DISPATCH (tcp relay | udp tunnel)
//! ```
//!
//! Any failure drops the accepted stream, which closes it exactly once. The
//! peer never gets an error response.

use super::policy::{AddressFilter, AdmissionStats};
use super::resolver::{resolve_destination, DnsResolver, HostResolver};
use super::tcp::{self, RelayTotals};
use crate::config::ServerConfig;
use crate::mux::{ConnectionId, UdpMultiplexer};
use relay_core::{Protocol, RelayError, RelayResult, RoutingHeader, HEADER_TERMINATOR};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

/// Knobs the gate needs from the server configuration.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub max_header_len: usize,
    /// Bounds the header read and the outbound TCP dial.
    pub idle_timeout: Duration,
    pub relay_buffer_size: usize,
    pub strict_resolution: bool,
}

impl GateSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_header_len: config.max_header_len,
            idle_timeout: config.idle_timeout,
            relay_buffer_size: config.relay_buffer_size,
            strict_resolution: config.strict_resolution,
        }
    }
}

/// How a connection that made it through the gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Plain TCP relay finished.
    Relayed(RelayTotals),
    /// UDP tunnel closed cleanly.
    Tunneled,
}

/// Admission plus dispatch for accepted connections.
pub struct ConnectionGate<R: HostResolver = DnsResolver> {
    filter: AddressFilter,
    resolver: R,
    stats: Arc<AdmissionStats>,
    mux: UdpMultiplexer,
    settings: GateSettings,
}

impl<R: HostResolver> ConnectionGate<R> {
    pub fn new(
        filter: AddressFilter,
        resolver: R,
        stats: Arc<AdmissionStats>,
        mux: UdpMultiplexer,
        settings: GateSettings,
    ) -> Self {
        Self {
            filter,
            resolver,
            stats,
            mux,
            settings,
        }
    }

    pub fn stats(&self) -> &Arc<AdmissionStats> {
        &self.stats
    }

    pub fn multiplexer(&self) -> &UdpMultiplexer {
        &self.mux
    }

    /// Source check, done before a single byte is read.
    pub fn admit(&self, peer: SocketAddr) -> bool {
        if self.filter.is_source_allowed(peer.ip()) {
            self.stats.record_accepted();
            true
        } else {
            self.stats.record_blocked_source();
            debug!(peer = %peer, "blocked connection");
            false
        }
    }

    /// Read the routing header from an admitted connection and hand the
    /// connection to the TCP relay or the UDP multiplexer.
    ///
    /// The stream is consumed; on every error path it is dropped (closed)
    /// before this returns.
    pub async fn handle<S>(
        &self,
        conn_id: ConnectionId,
        peer: SocketAddr,
        stream: S,
    ) -> RelayResult<GateOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _guard = self.stats.acquire();
        let mut reader = BufReader::new(stream);

        let line = time::timeout(
            self.settings.idle_timeout,
            read_header(&mut reader, self.settings.max_header_len),
        )
        .await
        .unwrap_or(Err(RelayError::Timeout))
        .and_then(|line| RoutingHeader::parse(&line));
        let header = match line {
            Ok(header) => header,
            Err(e) => {
                self.stats.record_rejected_header();
                debug!(conn_id, peer = %peer, error = %e, "rejected routing header");
                return Err(e);
            }
        };

        let destination = match resolve_destination(
            &self.resolver,
            &header.target,
            &self.filter,
            self.settings.strict_resolution,
        )
        .await
        {
            Ok(destination) => destination,
            Err(e) => {
                match e {
                    RelayError::AdmissionDenied(_) | RelayError::Resolve(_) => {
                        self.stats.record_blocked_destination();
                        debug!(conn_id, address = %header.target, error = %e, "destination host is blocked");
                    }
                    _ => {
                        self.stats.record_rejected_header();
                        debug!(conn_id, address = %header.target, error = %e, "invalid destination");
                    }
                }
                return Err(e);
            }
        };

        let pending = reader.buffer().to_vec();
        let stream = reader.into_inner();
        debug!(
            conn_id,
            peer = %peer,
            protocol = %header.protocol,
            destination = %destination,
            "relaying connection"
        );

        match header.protocol {
            Protocol::Tcp => {
                let remote = match time::timeout(
                    self.settings.idle_timeout,
                    TcpStream::connect(destination.addr),
                )
                .await
                {
                    Ok(Ok(remote)) => remote,
                    Ok(Err(e)) => {
                        self.stats.record_dial_failure();
                        return Err(RelayError::Transport(format!(
                            "failed to dial {destination}: {e}"
                        )));
                    }
                    Err(_) => {
                        self.stats.record_dial_failure();
                        return Err(RelayError::Timeout);
                    }
                };
                let totals =
                    tcp::relay(stream, remote, &pending, self.settings.relay_buffer_size).await;
                Ok(GateOutcome::Relayed(totals))
            }
            Protocol::Udp => {
                self.mux.serve(conn_id, &destination, stream, pending).await?;
                Ok(GateOutcome::Tunneled)
            }
        }
    }
}

/// Read the routing header: everything up to and including the first CR,
/// at most `max_len` bytes.
///
/// An LF that is already buffered right after the CR is consumed too. Other
/// buffered bytes stay in `reader`.
pub async fn read_header<S>(reader: &mut BufReader<S>, max_len: usize) -> RelayResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    let n = (&mut *reader)
        .take(max_len as u64)
        .read_until(HEADER_TERMINATOR, &mut line)
        .await?;

    if n == 0 {
        return Err(RelayError::Protocol(
            "connection closed before routing header".into(),
        ));
    }
    if line.last() != Some(&HEADER_TERMINATOR) {
        return Err(RelayError::Protocol(if n >= max_len {
            format!("routing header exceeds {max_len} bytes")
        } else {
            "routing header not terminated".into()
        }));
    }

    if reader.buffer().first() == Some(&b'\n') {
        reader.consume(1);
    }
    Ok(line)
}
