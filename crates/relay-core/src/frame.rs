//! UDP-over-TCP tunnel frames.
//!
//! Client→server: `[6-byte session id][2-byte channel id][datagram]`
//! Server→client: `[2-byte channel id][datagram]`
//!
//! The TCP stream carries no length prefix; one read is one frame.

use crate::error::{RelayError, RelayResult};
use std::fmt;

pub const SESSION_ID_LEN: usize = 6;
pub const CHANNEL_ID_LEN: usize = 2;
/// Length of the flow identifier that prefixes every client frame.
pub const FLOW_ID_LEN: usize = SESSION_ID_LEN + CHANNEL_ID_LEN;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Identifier of one multiplexed UDP conversation inside a tunnel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId([u8; FLOW_ID_LEN]);

impl FlowId {
    pub fn new(session: [u8; SESSION_ID_LEN], channel: [u8; CHANNEL_ID_LEN]) -> Self {
        let mut id = [0u8; FLOW_ID_LEN];
        id[..SESSION_ID_LEN].copy_from_slice(&session);
        id[SESSION_ID_LEN..].copy_from_slice(&channel);
        Self(id)
    }

    pub fn session(&self) -> [u8; SESSION_ID_LEN] {
        let mut s = [0u8; SESSION_ID_LEN];
        s.copy_from_slice(&self.0[..SESSION_ID_LEN]);
        s
    }

    /// The channel id, echoed verbatim in every server→client frame.
    pub fn channel(&self) -> [u8; CHANNEL_ID_LEN] {
        [self.0[SESSION_ID_LEN], self.0[SESSION_ID_LEN + 1]]
    }

    pub fn as_bytes(&self) -> &[u8; FLOW_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowId({self})")
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i == SESSION_ID_LEN {
                f.write_str("/")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Split a client frame into its flow id and datagram payload.
///
/// Frames shorter than [`FLOW_ID_LEN`] are a protocol violation.
pub fn decode_frame(frame: &[u8]) -> RelayResult<(FlowId, &[u8])> {
    if frame.len() < FLOW_ID_LEN {
        return Err(RelayError::Protocol(format!(
            "tunnel frame too short: {} bytes",
            frame.len()
        )));
    }
    let mut id = [0u8; FLOW_ID_LEN];
    id.copy_from_slice(&frame[..FLOW_ID_LEN]);
    Ok((FlowId(id), &frame[FLOW_ID_LEN..]))
}

/// Build a server→client frame for a datagram received on `channel`.
pub fn encode_reply(channel: [u8; CHANNEL_ID_LEN], datagram: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CHANNEL_ID_LEN + datagram.len());
    frame.extend_from_slice(&channel);
    frame.extend_from_slice(datagram);
    frame
}
