//! Tunnel and flow registry.
//!
//! Holds the two maps shared by every UDP-mode connection task:
//! tunnel key → tunnel, and (tunnel key, flow id) → flow. Both live behind one
//! async mutex so tunnel creation, flow creation, flow teardown and tunnel
//! teardown never interleave on the maps.

use super::ConnectionId;
use relay_core::FlowId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::debug;

/// Identifies one tunnel: the accepted connection plus its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub conn_id: ConnectionId,
    pub destination: SocketAddr,
}

/// Identifies one flow inside a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub tunnel: TunnelKey,
    pub flow: FlowId,
}

/// Bookkeeping for a registered tunnel.
struct TunnelEntry {
    opened_at: Instant,
}

/// Bookkeeping for a running flow task.
struct FlowEntry {
    /// Payloads from the tunnel to the flow's UDP socket.
    tx: mpsc::Sender<Vec<u8>>,
    /// Stops the flow task; dropping the task closes its socket.
    abort: AbortHandle,
    /// Distinguishes this flow from a later one reusing the same key.
    serial: u64,
}

#[derive(Default)]
struct RegistryState {
    tunnels: HashMap<TunnelKey, TunnelEntry>,
    flows: HashMap<FlowKey, FlowEntry>,
}

/// Summary of a removed tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelTeardown {
    /// Child flows that were still running and got stopped.
    pub flows: usize,
    pub lifetime: Duration,
}

/// Registry of live tunnels and flows.
#[derive(Default)]
pub struct TunnelRegistry {
    state: Mutex<RegistryState>,
    next_serial: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tunnel.
    ///
    /// Returns `false` if a tunnel with the same key is already registered.
    pub async fn register_tunnel(&self, key: TunnelKey) -> bool {
        let mut state = self.state.lock().await;
        if state.tunnels.contains_key(&key) {
            return false;
        }
        state.tunnels.insert(
            key,
            TunnelEntry {
                opened_at: Instant::now(),
            },
        );
        true
    }

    /// Remove a tunnel and stop every flow that belongs to it.
    ///
    /// Returns `None` if the tunnel was not registered.
    pub async fn remove_tunnel(&self, key: &TunnelKey) -> Option<TunnelTeardown> {
        let mut state = self.state.lock().await;
        let entry = state.tunnels.remove(key)?;

        let mut stopped = 0;
        state.flows.retain(|flow_key, flow| {
            if flow_key.tunnel == *key {
                flow.abort.abort();
                stopped += 1;
                false
            } else {
                true
            }
        });

        Some(TunnelTeardown {
            flows: stopped,
            lifetime: entry.opened_at.elapsed(),
        })
    }

    /// Sender for a live flow, or `None` if there is no flow for `key` or its
    /// task has already stopped.
    pub async fn flow_sender(&self, key: &FlowKey) -> Option<mpsc::Sender<Vec<u8>>> {
        let state = self.state.lock().await;
        state
            .flows
            .get(key)
            .filter(|entry| !entry.tx.is_closed())
            .map(|entry| entry.tx.clone())
    }

    /// Start and register a flow under `key`.
    ///
    /// `start` receives the flow's serial and must spawn the flow task,
    /// returning its payload sender and abort handle. It runs with the
    /// registry locked, so the task cannot deregister itself before it has
    /// been registered. A stale entry under the same key is stopped and
    /// replaced.
    ///
    /// Returns `None` without calling `start` if the parent tunnel is not
    /// registered (it is being torn down).
    pub async fn start_flow<F>(&self, key: FlowKey, start: F) -> Option<mpsc::Sender<Vec<u8>>>
    where
        F: FnOnce(u64) -> (mpsc::Sender<Vec<u8>>, AbortHandle),
    {
        let mut state = self.state.lock().await;
        if !state.tunnels.contains_key(&key.tunnel) {
            return None;
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, abort) = start(serial);
        if let Some(stale) = state.flows.insert(
            key,
            FlowEntry {
                tx: tx.clone(),
                abort,
                serial,
            },
        ) {
            stale.abort.abort();
        }
        Some(tx)
    }

    /// Deregister a flow whose task has ended on its own.
    ///
    /// Only removes the entry if it still belongs to the flow with `serial`.
    pub async fn remove_flow(&self, key: &FlowKey, serial: u64) -> bool {
        let mut state = self.state.lock().await;
        match state.flows.get(key) {
            Some(entry) if entry.serial == serial => {
                state.flows.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Stop and deregister a single flow. Siblings and the tunnel are left
    /// untouched.
    pub async fn close_flow(&self, key: &FlowKey) -> bool {
        let mut state = self.state.lock().await;
        match state.flows.remove(key) {
            Some(entry) => {
                entry.abort.abort();
                debug!(flow = %key.flow, destination = %key.tunnel.destination, "flow closed");
                true
            }
            None => false,
        }
    }

    pub async fn tunnel_count(&self) -> usize {
        self.state.lock().await.tunnels.len()
    }

    pub async fn flow_count(&self) -> usize {
        self.state.lock().await.flows.len()
    }

    /// Number of flows registered under one tunnel.
    #[cfg(test)]
    pub async fn flows_in(&self, key: &TunnelKey) -> usize {
        let state = self.state.lock().await;
        state.flows.keys().filter(|k| k.tunnel == *key).count()
    }
}
