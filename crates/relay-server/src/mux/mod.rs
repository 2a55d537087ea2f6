//! UDP multiplexer — many UDP conversations carried inside one TCP stream.
//!
//! # Submodule Architecture
//!
//! - **[`registry`]** — [`TunnelRegistry`], the only state shared between
//!   connection tasks: tunnel key → tunnel and (tunnel key, flow id) → flow,
//!   both behind one async mutex.
//! - **[`tunnel`]** — [`UdpMultiplexer`], which runs one tunnel per UDP-mode
//!   connection: a frame reader on the connection task plus a single writer
//!   task draining the outbound queue.
//! - **[`flow`]** — one task per flow owning a connected UDP socket.
//!
//! # Data Flow
//!
//! ```text
//! client frame [session|channel|payload]
//!   → UdpMultiplexer::route_frame
//!       → TunnelRegistry::flow_sender / start_flow
//!       → flow task → UdpSocket::send
//! UdpSocket::recv → flow task → [channel|payload]
//!   → outbound queue → writer task → client
//! ```
//!
//! # Teardown
//!
//! Closing the TCP connection ends the reader, which removes the tunnel and
//! aborts every flow task it owned (dropping their sockets). A flow that
//! fails or idles out removes only its own registry entry.

pub mod flow;
pub mod registry;
pub mod tunnel;

pub use registry::TunnelRegistry;
pub use tunnel::UdpMultiplexer;

/// Identifier assigned to every accepted connection.
pub type ConnectionId = u64;
