//! relay-core: shared protocol library for the transport relay.
//!
//! Provides the in-band routing header codec, the UDP-over-TCP tunnel frame
//! codec, the IP prefix set used for admission, and the common error type.
//! Nothing in this crate performs I/O.

pub mod error;
pub mod frame;
pub mod header;
pub mod prefix;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use frame::{decode_frame, encode_reply, FlowId, FLOW_ID_LEN, MAX_DATAGRAM_LEN};
pub use header::{split_host_port, Protocol, RoutingHeader, HEADER_TERMINATOR};
pub use prefix::PrefixSet;
