//! Immutable IP prefix set with containment lookup.
//!
//! Prefixes are truncated to their network address and aggregated when the
//! set is built, so each family holds a sorted list of disjoint networks and
//! a lookup is one binary search.

use crate::error::{RelayError, RelayResult};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::IpAddr;

/// A read-only set of IPv4/IPv6 prefixes.
///
/// Built once, then shared freely between tasks (`Send + Sync`, no interior
/// mutability).
#[derive(Debug, Clone, Default)]
pub struct PrefixSet {
    v4: Vec<Ipv4Net>,
    v6: Vec<Ipv6Net>,
}

impl PrefixSet {
    /// Build a set from already-parsed networks.
    pub fn new<I>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = IpNet>,
    {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for net in prefixes {
            match net.trunc() {
                IpNet::V4(n) => v4.push(n),
                IpNet::V6(n) => v6.push(n),
            }
        }

        let mut v4 = Ipv4Net::aggregate(&v4);
        let mut v6 = Ipv6Net::aggregate(&v6);
        v4.sort_by_key(|n| n.network());
        v6.sort_by_key(|n| n.network());
        Self { v4, v6 }
    }

    /// Parse a list of CIDR strings. A bare address is a single-host prefix.
    pub fn parse<I, S>(entries: I) -> RelayResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let nets = entries
            .into_iter()
            .map(|e| parse_prefix(e.as_ref()))
            .collect::<RelayResult<Vec<_>>>()?;
        Ok(Self::new(nets))
    }

    /// True if any prefix in the set contains `addr`.
    ///
    /// IPv4-mapped IPv6 addresses are checked against the IPv4 prefixes.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(a) => {
                let idx = self.v4.partition_point(|n| n.network() <= a);
                idx > 0 && self.v4[idx - 1].contains(&a)
            }
            IpAddr::V6(a) => {
                if let Some(mapped) = a.to_ipv4_mapped() {
                    return self.contains(IpAddr::V4(mapped));
                }
                let idx = self.v6.partition_point(|n| n.network() <= a);
                idx > 0 && self.v6[idx - 1].contains(&a)
            }
        }
    }

    /// Number of disjoint networks after aggregation.
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// Parse `a.b.c.d/n`, `x::y/n`, or a bare address.
pub fn parse_prefix(entry: &str) -> RelayResult<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| RelayError::Config(format!("invalid IP prefix: {entry:?}")))
}
