//! Server configuration.
//!
//! The tree is serde-deserializable (TOML/JSON/YAML via the embedder's
//! loader of choice) and every knob has a production default, so an
//! empty document is a valid configuration. Durations are expressed in
//! seconds or milliseconds in the field name; typed accessors return
//! [`Duration`].

use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_CLUSTER_DIAL_TIMEOUT_SECS, DEFAULT_CLUSTER_REQ_TIMEOUT_SECS,
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_HIBERNATE_TIME_SECS,
    DEFAULT_KEEP_ALIVE_TIMEOUT_SECS, DEFAULT_KV_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_KV_LEASE_TTL_SECS, DEFAULT_MAX_CONNECTIONS_PER_IP, DEFAULT_MAX_QUEUE_SIZE,
    DEFAULT_MAX_STANZA_SIZE, DEFAULT_MAX_TOTAL_CONNECTIONS, DEFAULT_READ_RATE_BURST,
    DEFAULT_READ_RATE_BYTES_PER_SEC, DEFAULT_REQ_TIMEOUT_SECS,
    DEFAULT_REQUEST_ACK_INTERVAL_SECS, DEFAULT_WAIT_FOR_ACK_TIMEOUT_SECS,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Virtual hosts served by this instance. Stanzas addressed to any
    /// other domain are federated over S2S.
    pub hosts: Vec<String>,
    pub c2s: C2sConfig,
    pub cluster: ClusterConfig,
    pub sm: SmConfig,
    /// Seconds allowed for connection draining at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(if self.shutdown_timeout_secs == 0 {
            30
        } else {
            self.shutdown_timeout_secs
        })
    }

    /// Whether a domain is served locally.
    pub fn is_local_host(&self, domain: &str) -> bool {
        self.hosts.iter().any(|h| h == domain)
    }
}

/// Per-listener C2S configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct C2sConfig {
    /// Listener bind address.
    pub bind_addr: String,
    /// Whether the listener expects a TLS handshake before the stream
    /// header (direct TLS) instead of offering STARTTLS.
    pub direct_tls: bool,
    pub connect_timeout_secs: u64,
    pub keep_alive_timeout_secs: u64,
    pub req_timeout_secs: u64,
    /// Maximum inbound stanza size in bytes; exceeding it closes the
    /// stream with `policy-violation`.
    pub max_stanza_size: usize,
    pub max_connections_per_ip: usize,
    /// 0 = unlimited.
    pub max_total_connections: usize,
    pub read_rate: ReadRateConfig,
}

impl Default for C2sConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5222".to_owned(),
            direct_tls: false,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            keep_alive_timeout_secs: DEFAULT_KEEP_ALIVE_TIMEOUT_SECS,
            req_timeout_secs: DEFAULT_REQ_TIMEOUT_SECS,
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            read_rate: ReadRateConfig::default(),
        }
    }
}

impl C2sConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn req_timeout(&self) -> Duration {
        Duration::from_secs(self.req_timeout_secs)
    }
}

/// Token-bucket read limits applied per stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadRateConfig {
    pub bytes_per_sec: usize,
    pub burst: usize,
}

impl Default for ReadRateConfig {
    fn default() -> Self {
        Self {
            bytes_per_sec: DEFAULT_READ_RATE_BYTES_PER_SEC,
            burst: DEFAULT_READ_RATE_BURST,
        }
    }
}

/// Cluster membership and peer RPC configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Bind address of the cluster RPC listener.
    pub bind_addr: String,
    /// TTL lease on member and resource records.
    pub lease_ttl_secs: u64,
    /// Lease refresh interval; must stay below the TTL.
    pub heartbeat_interval_secs: u64,
    pub dial_timeout_secs: u64,
    pub req_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5310".to_owned(),
            lease_ttl_secs: DEFAULT_KV_LEASE_TTL_SECS,
            heartbeat_interval_secs: DEFAULT_KV_HEARTBEAT_INTERVAL_SECS,
            dial_timeout_secs: DEFAULT_CLUSTER_DIAL_TIMEOUT_SECS,
            req_timeout_secs: DEFAULT_CLUSTER_REQ_TIMEOUT_SECS,
        }
    }
}

impl ClusterConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn req_timeout(&self) -> Duration {
        Duration::from_secs(self.req_timeout_secs)
    }
}

/// Stream management (XEP-0198) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmConfig {
    /// How long a hibernated stream is retained before its queue and
    /// resource record are garbage-collected.
    pub hibernate_time_secs: u64,
    /// Outbound silence after which the server transmits `<r/>`.
    pub request_ack_interval_secs: u64,
    /// Grace period for the client to answer an `<r/>`.
    pub wait_for_ack_timeout_secs: u64,
    /// Bound on unacknowledged elements per stream.
    pub max_queue_size: usize,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            hibernate_time_secs: DEFAULT_HIBERNATE_TIME_SECS,
            request_ack_interval_secs: DEFAULT_REQUEST_ACK_INTERVAL_SECS,
            wait_for_ack_timeout_secs: DEFAULT_WAIT_FOR_ACK_TIMEOUT_SECS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

impl SmConfig {
    pub fn hibernate_time(&self) -> Duration {
        Duration::from_secs(self.hibernate_time_secs)
    }

    pub fn request_ack_interval(&self) -> Duration {
        Duration::from_secs(self.request_ack_interval_secs)
    }

    pub fn wait_for_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_for_ack_timeout_secs)
    }
}
