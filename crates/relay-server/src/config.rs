//! Server configuration: TOML file + CLI overrides.

use relay_core::header::DEFAULT_MAX_HEADER_LEN;
use relay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Bounds for the TCP relay copy buffer.
pub const MIN_RELAY_BUFFER: usize = 32 * 1024;
pub const MAX_RELAY_BUFFER: usize = 256 * 1024;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub filter: FilterSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_max_header_len")]
    pub max_header_len: usize,
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
    #[serde(default = "default_udp_frame_buffer")]
    pub udp_frame_buffer: usize,
    #[serde(default)]
    pub strict_resolution: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            idle_timeout: default_idle_timeout(),
            max_header_len: default_max_header_len(),
            relay_buffer_size: default_relay_buffer_size(),
            udp_frame_buffer: default_udp_frame_buffer(),
            strict_resolution: false,
        }
    }
}

/// `[filter]` section of the config TOML.
///
/// Either list falls back to the built-in defaults when omitted. An explicit
/// empty `source_allow` admits nobody.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterSection {
    pub source_allow: Option<Vec<String>>,
    pub destination_deny: Option<Vec<String>>,
}

fn default_bind() -> String {
    "0.0.0.0:6666".to_string()
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_max_header_len() -> usize {
    DEFAULT_MAX_HEADER_LEN
}
fn default_relay_buffer_size() -> usize {
    MIN_RELAY_BUFFER
}
fn default_udp_frame_buffer() -> usize {
    64 * 1024
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub idle_timeout: Duration,
    pub max_header_len: usize,
    pub relay_buffer_size: usize,
    pub udp_frame_buffer: usize,
    pub strict_resolution: bool,
    pub source_allow: Vec<String>,
    pub destination_deny: Vec<String>,
}

impl ServerConfig {
    /// Load config from a TOML file (missing file means defaults), then apply
    /// CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_idle_timeout: Option<u64>,
    ) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(file_config, cli_bind, cli_idle_timeout)
    }

    fn from_file(
        file_config: ConfigFile,
        cli_bind: Option<&str>,
        cli_idle_timeout: Option<u64>,
    ) -> RelayResult<Self> {
        let server = file_config.server;

        let bind_str = cli_bind.unwrap_or(&server.bind);
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|_| RelayError::Config(format!("invalid bind address: {bind_str:?}")))?;

        let idle_secs = cli_idle_timeout.unwrap_or(server.idle_timeout);
        if idle_secs == 0 {
            return Err(RelayError::Config("idle_timeout must be at least 1 second".into()));
        }
        if server.max_header_len < 4 {
            return Err(RelayError::Config("max_header_len is too small".into()));
        }
        if server.udp_frame_buffer <= relay_core::FLOW_ID_LEN {
            return Err(RelayError::Config("udp_frame_buffer is too small".into()));
        }

        Ok(Self {
            bind,
            idle_timeout: Duration::from_secs(idle_secs),
            max_header_len: server.max_header_len,
            relay_buffer_size: server
                .relay_buffer_size
                .clamp(MIN_RELAY_BUFFER, MAX_RELAY_BUFFER),
            udp_frame_buffer: server.udp_frame_buffer,
            strict_resolution: server.strict_resolution,
            source_allow: file_config
                .filter
                .source_allow
                .unwrap_or_else(default_source_allow),
            destination_deny: file_config
                .filter
                .destination_deny
                .unwrap_or_else(default_destination_deny),
        })
    }
}

/// Loopback plus the Cloudflare edge ranges: the relay only accepts traffic
/// forwarded by the edge worker.
pub fn default_source_allow() -> Vec<String> {
    [
        "127.0.0.0/8",
        "103.21.244.0/22",
        "103.22.200.0/22",
        "103.31.4.0/22",
        "104.16.0.0/12",
        "108.162.192.0/18",
        "131.0.72.0/22",
        "141.101.64.0/18",
        "162.158.0.0/15",
        "172.64.0.0/13",
        "173.245.48.0/20",
        "188.114.96.0/20",
        "190.93.240.0/20",
        "197.234.240.0/22",
        "198.41.128.0/17",
        "::1/128",
        "2400:cb00::/32",
        "2405:8100::/32",
        "2405:b500::/32",
        "2606:4700::/32",
        "2803:f800::/32",
        "2c0f:f248::/32",
        "2a06:98c0::/29",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Public BitTorrent trackers.
pub fn default_destination_deny() -> Vec<String> {
    [
        "93.158.213.92", "102.223.180.235", "23.134.88.6", "185.243.218.213",
        "208.83.20.20", "91.216.110.52", "83.146.97.90", "23.157.120.14",
        "185.102.219.163", "163.172.29.130", "156.234.201.18", "209.141.59.16",
        "34.94.213.23", "192.3.165.191", "130.61.55.93", "109.201.134.183",
        "95.31.11.224", "83.102.180.21", "192.95.46.115", "198.100.149.66",
        "95.216.74.39", "51.68.174.87", "37.187.111.136", "51.15.79.209",
        "45.92.156.182", "49.12.76.8", "5.196.89.204", "62.233.57.13",
        "45.9.60.30", "35.227.12.84", "179.43.155.30", "94.243.222.100",
        "207.241.231.226", "207.241.226.111", "51.159.54.68", "82.65.115.10",
        "95.217.167.10", "86.57.161.157", "83.31.30.230", "94.103.87.87",
        "160.119.252.41", "193.42.111.57", "80.240.22.46", "107.189.31.134",
        "104.244.79.114", "85.239.33.28", "61.222.178.254", "38.7.201.142",
        "51.81.222.188", "103.196.36.31", "23.153.248.2", "73.170.204.100",
        "176.31.250.174", "149.56.179.233", "212.237.53.230", "185.68.21.244",
        "82.156.24.219", "216.201.9.155", "51.15.41.46", "85.206.172.159",
        "104.244.77.87", "37.27.4.53", "192.3.165.198", "15.204.205.14",
        "103.122.21.50", "104.131.98.232", "173.249.201.201", "23.254.228.89",
        "5.102.159.190", "65.130.205.148", "119.28.71.45", "159.69.65.157",
        "160.251.78.190", "107.189.7.143", "159.65.224.91", "185.217.199.21",
        "91.224.92.110", "161.97.67.210", "51.15.3.74", "209.126.11.233",
        "37.187.95.112", "167.99.185.219", "144.91.88.22", "88.99.2.212",
        "37.59.48.81", "95.179.130.187", "51.15.26.25", "192.9.228.30",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, None, None).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:6666".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.relay_buffer_size, MIN_RELAY_BUFFER);
        assert!(!cfg.strict_resolution);
        assert_eq!(cfg.source_allow, default_source_allow());
        assert_eq!(cfg.destination_deny, default_destination_deny());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = ServerConfig::load(Some(&path), None, None).unwrap();
        assert_eq!(cfg.max_header_len, DEFAULT_MAX_HEADER_LEN);
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind = "127.0.0.1:7000"
idle_timeout = 10
relay_buffer_size = 1048576
strict_resolution = true

[filter]
source_allow = ["10.0.0.0/8"]
destination_deny = []
"#
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(file.path()), None, None).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.idle_timeout, Duration::from_secs(10));
        assert_eq!(cfg.relay_buffer_size, MAX_RELAY_BUFFER);
        assert!(cfg.strict_resolution);
        assert_eq!(cfg.source_allow, vec!["10.0.0.0/8".to_string()]);
        assert!(cfg.destination_deny.is_empty());

        let cfg = ServerConfig::load(Some(file.path()), Some("127.0.0.1:9000"), Some(5)).unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ServerConfig::load(None, Some("not-an-addr"), None).is_err());
        assert!(ServerConfig::load(None, None, Some(0)).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nidle_timeout = \"soon\"").unwrap();
        let err = ServerConfig::load(Some(file.path()), None, None).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
