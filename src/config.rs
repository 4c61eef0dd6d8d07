//! dnsway configuration

use crate::codec::{DownstreamMode, SegmentCodec};
use crate::transmission::{SegmentLimits, DEFAULT_MAX_IN_TRANSIT};
use crate::{DnswayError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main dnsway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnswayConfig {
    /// Settings shared by both ends of the tunnel
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Client (local proxy) settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Responder settings (server mode)
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

/// Tunnel parameters both ends must agree on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Domain the responder is authoritative for
    #[serde(default)]
    pub domain: String,

    /// Shared secret for one-time codes
    #[serde(default)]
    pub secret: String,

    /// Downstream representation (alias or text)
    #[serde(default)]
    pub mode: DownstreamMode,

    /// Base delay between idle polls
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Sessions without traffic this long are closed
    #[serde(with = "humantime_serde", default = "default_inactivity_timeout")]
    pub inactivity_timeout: Duration,

    /// How long to wait for a single DNS answer
    #[serde(with = "humantime_serde", default = "default_query_timeout")]
    pub query_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            secret: String::new(),
            mode: DownstreamMode::default(),
            poll_interval: default_poll_interval(),
            inactivity_timeout: default_inactivity_timeout(),
            query_timeout: default_query_timeout(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Local proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Listen address of the HTTP proxy
    pub listen_addr: SocketAddr,

    /// Recursive resolver to send tunnel queries to (None = auto-detect)
    pub resolver: Option<SocketAddr>,

    /// Run the loopback DNS relay
    pub enable_relay: bool,

    /// Listen address of the DNS relay
    pub relay_listen: SocketAddr,

    /// Override of the upstream segment length
    pub upstream_segment_len: Option<usize>,

    /// Override of the downstream segment length
    pub downstream_segment_len: Option<usize>,

    /// Ceiling on unacknowledged upstream bytes per session
    pub max_in_transit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            resolver: None,
            enable_relay: false,
            relay_listen: SocketAddr::from(([127, 0, 0, 1], 53)),
            upstream_segment_len: None,
            downstream_segment_len: None,
            max_in_transit: DEFAULT_MAX_IN_TRANSIT,
        }
    }
}

/// Responder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP listen address for DNS
    #[serde(default = "default_server_listen")]
    pub listen_addr: SocketAddr,

    /// Where accepted tunnel streams are sent (an HTTP proxy)
    pub forward_addr: SocketAddr,

    /// Resolver for queries outside the tunnel domain (None = refuse them)
    #[serde(default)]
    pub upstream_resolver: Option<SocketAddr>,

    /// How often idle sessions are reaped
    #[serde(with = "humantime_serde", default = "default_reap_interval")]
    pub reap_interval: Duration,
}

impl ServerConfig {
    pub fn new(forward_addr: SocketAddr) -> Self {
        Self {
            listen_addr: default_server_listen(),
            forward_addr,
            upstream_resolver: None,
            reap_interval: default_reap_interval(),
        }
    }
}

fn default_server_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(10)
}

impl DnswayConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| DnswayError::InvalidConfig(e.to_string()))
    }

    /// Codec for the configured tunnel domain
    pub fn codec(&self) -> Result<SegmentCodec> {
        SegmentCodec::new(&self.tunnel.domain)
    }

    /// Segment limits for client sessions, overrides applied
    pub fn segment_limits(&self) -> Result<SegmentLimits> {
        let codec = self.codec()?;
        let natural = SegmentLimits::for_codec(&codec, self.tunnel.mode);
        let mut limits = natural;

        if let Some(len) = self.client.upstream_segment_len {
            if len == 0 || len > natural.max_upstream {
                return Err(DnswayError::InvalidConfig(format!(
                    "Upstream segment length must be 1..={}, got {}",
                    natural.max_upstream, len
                )));
            }
            limits.max_upstream = len;
        }

        if let Some(len) = self.client.downstream_segment_len {
            if len == 0 || len > natural.max_downstream {
                return Err(DnswayError::InvalidConfig(format!(
                    "Downstream segment length must be 1..={} in {:?} mode, got {}",
                    natural.max_downstream, self.tunnel.mode, len
                )));
            }
            limits.max_downstream = len;
        }

        let limits = limits.with_max_in_transit(self.client.max_in_transit);
        limits.validate()?;
        Ok(limits)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.domain.is_empty() {
            return Err(DnswayError::InvalidConfig("Tunnel domain must be set".into()));
        }
        if self.tunnel.secret.is_empty() {
            return Err(DnswayError::InvalidConfig("Shared secret must be set".into()));
        }
        if self.tunnel.poll_interval.is_zero() {
            return Err(DnswayError::InvalidConfig("Poll interval must be non-zero".into()));
        }
        if self.tunnel.inactivity_timeout <= self.tunnel.poll_interval {
            return Err(DnswayError::InvalidConfig(
                "Inactivity timeout must exceed the poll interval".into(),
            ));
        }

        self.segment_limits()?;
        Ok(())
    }
}
