//! Admission policy — which sources may connect and which destinations may
//! be reached.
//!
//! The policy layer is split into two types:
//!
//! - [`AddressFilter`] — the immutable prefix lookups (source allow-list,
//!   destination deny-list), built once at startup and shared read-only.
//! - [`AdmissionStats`] — lock-free counters of admission decisions plus an
//!   active-connection gauge maintained by [`ConnectionGuard`].

use relay_core::{PrefixSet, RelayResult};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Source admission and destination denial by prefix containment.
///
/// Invalid or unresolvable addresses never reach this type; the gate treats
/// them as disallowed before asking.
#[derive(Debug, Clone)]
pub struct AddressFilter {
    /// Sources allowed to connect.
    source_allow: PrefixSet,
    /// Destinations that must never be dialed.
    destination_deny: PrefixSet,
}

impl AddressFilter {
    pub fn new(source_allow: PrefixSet, destination_deny: PrefixSet) -> Self {
        Self {
            source_allow,
            destination_deny,
        }
    }

    /// Build a filter from configuration lists.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first entry that is neither a
    /// CIDR prefix nor an address.
    pub fn from_lists<S: AsRef<str>>(source_allow: &[S], destination_deny: &[S]) -> RelayResult<Self> {
        Ok(Self::new(
            PrefixSet::parse(source_allow)?,
            PrefixSet::parse(destination_deny)?,
        ))
    }

    /// True iff `addr` is inside at least one allow-listed prefix.
    pub fn is_source_allowed(&self, addr: IpAddr) -> bool {
        self.source_allow.contains(addr)
    }

    /// True iff `addr` is inside no deny-listed prefix.
    pub fn is_destination_allowed(&self, addr: IpAddr) -> bool {
        !self.destination_deny.contains(addr)
    }

    /// Sizes of the (aggregated) allow and deny lists, for startup logging.
    pub fn sizes(&self) -> (usize, usize) {
        (self.source_allow.len(), self.destination_deny.len())
    }
}

/// Counters of admission decisions, shared by every connection task.
///
/// All loads use `Relaxed` ordering; the values are for logging and tests,
/// not for synchronisation.
#[derive(Debug, Default)]
pub struct AdmissionStats {
    accepted: AtomicU64,
    blocked_sources: AtomicU64,
    blocked_destinations: AtomicU64,
    rejected_headers: AtomicU64,
    dial_failures: AtomicU64,
    active_connections: Arc<AtomicUsize>,
}

/// Point-in-time copy of [`AdmissionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub blocked_sources: u64,
    pub blocked_destinations: u64,
    pub rejected_headers: u64,
    pub dial_failures: u64,
    pub active_connections: usize,
}

impl AdmissionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked_source(&self) {
        self.blocked_sources.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked_destination(&self) {
        self.blocked_destinations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_header(&self) {
        self.rejected_headers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the active connection gauge. The returned guard is `Send`
    /// and decrements the gauge when the connection task drops it.
    pub fn acquire(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counter: self.active_connections.clone(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            blocked_sources: self.blocked_sources.load(Ordering::Relaxed),
            blocked_destinations: self.blocked_destinations.load(Ordering::Relaxed),
            rejected_headers: self.rejected_headers.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            active_connections: self.active_connections(),
        }
    }
}

/// RAII guard that decrements the active connection gauge on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
