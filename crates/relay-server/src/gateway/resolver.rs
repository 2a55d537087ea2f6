//! Destination resolution and validation.
//!
//! A literal address in the routing header is used as-is. Anything else goes
//! through a [`HostResolver`] (by default [`DnsResolver`], a thin wrapper over
//! `tokio::net::lookup_host`) and the first returned address is used.

use super::policy::AddressFilter;
use relay_core::{split_host_port, RelayError, RelayResult};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tokio::net;
use tracing::debug;

/// Name resolution seam, so the gate can be exercised without real DNS.
pub trait HostResolver: Send + Sync + 'static {
    /// Resolve `host` to its addresses, in resolver order.
    fn lookup(&self, host: &str) -> impl Future<Output = RelayResult<Vec<IpAddr>>> + Send;
}

/// System resolver backed by `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl HostResolver for DnsResolver {
    fn lookup(&self, host: &str) -> impl Future<Output = RelayResult<Vec<IpAddr>>> + Send {
        // lookup_host requires a port; it is discarded.
        let lookup_addr = format!("{host}:0");
        async move {
            let addrs: Vec<IpAddr> = net::lookup_host(&lookup_addr)
                .await
                .map_err(|e| RelayError::Resolve(format!("{lookup_addr}: {e}")))?
                .map(|a| a.ip())
                .collect();
            if addrs.is_empty() {
                return Err(RelayError::Resolve(format!("no addresses for {lookup_addr}")));
            }
            Ok(addrs)
        }
    }
}

/// A validated destination: the address that passed the deny check, plus the
/// host text it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub addr: SocketAddr,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<IpAddr>().is_ok() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}:{} ({})", self.host, self.addr.port(), self.addr.ip())
        }
    }
}

/// Turn a `host:port` target into an admitted [`Destination`].
///
/// With `strict` set, every resolved address must be admissible; otherwise
/// only the first one (the one that will be dialed) is checked.
///
/// # Errors
///
/// - [`RelayError::Protocol`] if the target is not `host:port`.
/// - [`RelayError::Resolve`] if name resolution fails.
/// - [`RelayError::AdmissionDenied`] if the address is deny-listed.
pub async fn resolve_destination<R: HostResolver>(
    resolver: &R,
    target: &str,
    filter: &AddressFilter,
    strict: bool,
) -> RelayResult<Destination> {
    let (host, port) = split_host_port(target)?;

    let candidates = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            let resolved = resolver.lookup(&host).await?;
            debug!(host = %host, count = resolved.len(), "resolved destination");
            resolved
        }
    };

    let first = *candidates
        .first()
        .ok_or_else(|| RelayError::Resolve(format!("no addresses for {host}")))?;

    let checked = if strict { &candidates[..] } else { &candidates[..1] };
    if let Some(denied) = checked.iter().find(|ip| !filter.is_destination_allowed(**ip)) {
        return Err(RelayError::AdmissionDenied(format!(
            "destination {host} resolves to blocked address {denied}"
        )));
    }

    Ok(Destination {
        host,
        addr: SocketAddr::new(first, port),
    })
}
