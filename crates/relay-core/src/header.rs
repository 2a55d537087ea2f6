//! In-band routing header.
//!
//! Wire format (sent once, immediately after connect):
//! `<protocol>@<host>$<port>\r`
//!
//! `$` stands in for the host/port colon so the header survives transports
//! that mangle colons. An unknown protocol tag falls back to `tcp`.

use crate::error::{RelayError, RelayResult};
use std::fmt;
use std::net::IpAddr;

/// Byte that terminates the routing header (carriage return).
pub const HEADER_TERMINATOR: u8 = b'\r';

/// Default upper bound on header length, terminator included.
pub const DEFAULT_MAX_HEADER_LEN: usize = 512;

/// Transport requested by the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Map a protocol tag to a protocol. Anything but `udp` means TCP.
    pub fn from_tag(tag: &str) -> Self {
        if tag == "udp" {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHeader {
    pub protocol: Protocol,
    /// Target in `host:port` form (`$` already replaced by `:`).
    pub target: String,
}

impl RoutingHeader {
    /// Parse a header line. A trailing `\r` or `\r\n` is stripped if present;
    /// any other CR or LF in the line is rejected.
    pub fn parse(line: &[u8]) -> RelayResult<Self> {
        let line = line
            .strip_suffix(b"\r\n")
            .or_else(|| line.strip_suffix(&[HEADER_TERMINATOR]))
            .unwrap_or(line);
        if line.is_empty() {
            return Err(RelayError::Protocol("empty routing header".into()));
        }
        if line.iter().any(|b| matches!(b, b'\r' | b'\n')) {
            return Err(RelayError::Protocol(
                "routing header contains a stray line break".into(),
            ));
        }

        let text = std::str::from_utf8(line)
            .map_err(|_| RelayError::Protocol("routing header is not valid UTF-8".into()))?;

        let mut tokens = text.split('@');
        let (tag, target) = match (tokens.next(), tokens.next()) {
            (Some(tag), Some(target)) => (tag, target),
            _ => {
                return Err(RelayError::Protocol(format!(
                    "routing header has no '@' separator: {text:?}"
                )))
            }
        };
        if tag.is_empty() || target.is_empty() {
            return Err(RelayError::Protocol(format!(
                "routing header has an empty token: {text:?}"
            )));
        }

        Ok(Self {
            protocol: Protocol::from_tag(tag),
            target: target.replace('$', ":"),
        })
    }

    /// Split the target into host and port.
    pub fn host_port(&self) -> RelayResult<(String, u16)> {
        split_host_port(&self.target)
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals (`[::1]:53`).
///
/// An unbracketed host containing a colon is rejected, matching the usual
/// `host:port` conventions.
pub fn split_host_port(target: &str) -> RelayResult<(String, u16)> {
    let bad = || RelayError::Protocol(format!("invalid host:port target: {target:?}"));

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(bad)?;
        let port = after.strip_prefix(':').ok_or_else(bad)?;
        if host.parse::<IpAddr>().is_err() {
            return Err(bad());
        }
        (host, port)
    } else {
        let (host, port) = target.rsplit_once(':').ok_or_else(bad)?;
        if host.contains(':') {
            return Err(bad());
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(bad());
    }
    let port: u16 = port.parse().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_header() {
        let header = RoutingHeader::parse(b"tcp@93.184.216.34$80\r").unwrap();
        assert_eq!(header.protocol, Protocol::Tcp);
        assert_eq!(header.target, "93.184.216.34:80");
        assert_eq!(
            header.host_port().unwrap(),
            ("93.184.216.34".to_string(), 80)
        );
    }

    #[test]
    fn parse_udp_header() {
        let header = RoutingHeader::parse(b"udp@10.0.0.5$5000\r").unwrap();
        assert_eq!(header.protocol, Protocol::Udp);
        assert_eq!(header.target, "10.0.0.5:5000");
    }

    #[test]
    fn unknown_protocol_defaults_to_tcp() {
        let header = RoutingHeader::parse(b"sctp@example.com$443\r").unwrap();
        assert_eq!(header.protocol, Protocol::Tcp);
        assert_eq!(header.target, "example.com:443");
    }

    #[test]
    fn header_without_separator_is_rejected() {
        assert!(RoutingHeader::parse(b"badheader\r").is_err());
    }

    #[test]
    fn empty_header_is_rejected() {
        assert!(RoutingHeader::parse(b"\r").is_err());
        assert!(RoutingHeader::parse(b"").is_err());
    }

    #[test]
    fn empty_sides_are_rejected() {
        assert!(RoutingHeader::parse(b"@1.2.3.4$80\r").is_err());
        assert!(RoutingHeader::parse(b"tcp@\r").is_err());
    }

    #[test]
    fn crlf_terminator_is_accepted() {
        let header = RoutingHeader::parse(b"udp@1.1.1.1$53\r\n").unwrap();
        assert_eq!(header.protocol, Protocol::Udp);
        assert_eq!(header.target, "1.1.1.1:53");
    }

    #[test]
    fn bare_lf_is_not_a_terminator() {
        assert!(RoutingHeader::parse(b"tcp@1.2.3.4$80\n").is_err());
        assert!(RoutingHeader::parse(b"tcp@1.2.3.4$80\n\r").is_err());
        assert!(RoutingHeader::parse(b"tcp@1.2.3.4\r$80\r").is_err());
    }

    #[test]
    fn bracketed_ipv6_target() {
        let header = RoutingHeader::parse(b"tcp@[2001:db8::1]$443\r").unwrap();
        assert_eq!(
            header.host_port().unwrap(),
            ("2001:db8::1".to_string(), 443)
        );
    }

    #[test]
    fn bad_targets_fail_to_split() {
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("example.com:http").is_err());
        assert!(split_host_port("example.com:70000").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("2001:db8::1:443").is_err());
        assert!(split_host_port("[example.com]:443").is_err());
    }
}
