//! Gateway module — admission, routing-header handling and plain TCP relaying.
//!
//! # Submodule Architecture
//!
//! - **[`policy`]** — [`AddressFilter`] (source allow-list, destination
//!   deny-list) and [`AdmissionStats`] counters.
//! - **[`resolver`]** — turns the header's `host:port` into an admitted
//!   [`Destination`](resolver::Destination); literal addresses never hit DNS.
//! - **[`gate`]** — [`ConnectionGate`], the per-connection state machine
//!   from accept to dispatch.
//! - **[`tcp`]** — the bidirectional byte pump used for `tcp` connections.
//!
//! # Data Flow
//!
//! ```text
//! accept
//!   → ConnectionGate::admit            (source allow-list)
//!   → ConnectionGate::handle
//!       → read_header / RoutingHeader::parse
//!       → resolve_destination         (destination deny-list)
//!       → tcp::relay                  (protocol tcp)
//!       → UdpMultiplexer::serve       (protocol udp)
//! ```

pub mod gate;
pub mod policy;
pub mod resolver;
pub mod tcp;

pub use gate::{ConnectionGate, GateOutcome, GateSettings};
pub use policy::{AddressFilter, AdmissionStats};
pub use resolver::DnsResolver;
