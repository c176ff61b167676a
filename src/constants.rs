//! Centralized protocol and configuration constants.
//!
//! This module consolidates the magic numbers used throughout the chorus
//! core. Having them in one place makes it easier to:
//!
//! - Understand the protocol constraints
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Stream Constants**: C2S stream negotiation and framing limits
//! - **Stream Management Constants**: XEP-0198 queue and timer defaults
//! - **Network Constants**: Connection limits
//! - **Cluster Constants**: KV layout, leases and peer RPC limits

use std::time::Duration;

// =============================================================================
// Stream Constants
// =============================================================================

/// Default maximum size of a single inbound stanza (32 KiB).
///
/// Exceeding it closes the stream with `policy-violation`. Large payload
/// transfer belongs to out-of-band mechanisms, not the stanza channel.
/// Can be overridden per listener via `C2sConfig.max_stanza_size`.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 32 * 1024;

/// Default time a connection may spend before completing resource binding.
///
/// Covers the TCP accept → stream open → SASL → bind window. A connection
/// that has not produced the next negotiation step within this window is
/// closed with `connection-timeout`.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default keep-alive window for bound streams.
///
/// A bound stream that stays silent longer than this is considered dead.
/// With stream management enabled the stream hibernates instead of being
/// torn down.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_SECS: u64 = 120;

/// Default deadline applied to externally-initiated requests
/// (router dispatch, KV reads, cluster RPCs) issued on behalf of a stream.
pub const DEFAULT_REQ_TIMEOUT_SECS: u64 = 60;

/// Default inbound read rate (bytes per second) per stream.
pub const DEFAULT_READ_RATE_BYTES_PER_SEC: usize = 16 * 1024;

/// Default burst allowance for the per-stream read rate limiter.
pub const DEFAULT_READ_RATE_BURST: usize = 64 * 1024;

// =============================================================================
// Stream Management (XEP-0198) Constants
// =============================================================================

/// XEP-0198 namespace.
pub const SM_NAMESPACE: &str = "urn:xmpp:sm:3";

/// Length of the random resume nonce embedded in an SMID.
pub const SM_NONCE_LENGTH: usize = 24;

/// Maximum JID length tolerated when decoding an SMID.
pub const SM_MAX_SMID_JID_LENGTH: usize = 256;

/// Default time a hibernated stream is retained before its queue and
/// resource record are garbage-collected.
pub const DEFAULT_HIBERNATE_TIME_SECS: u64 = 60;

/// Default interval of outbound silence after which the server requests
/// an ack (`<r/>`) from the client.
pub const DEFAULT_REQUEST_ACK_INTERVAL_SECS: u64 = 30;

/// Default grace period for the client to answer an `<r/>` before the
/// stream is disconnected with `connection-timeout`.
pub const DEFAULT_WAIT_FOR_ACK_TIMEOUT_SECS: u64 = 30;

/// Default bound on unacknowledged elements per stream queue.
///
/// Crossing it disconnects the stream with `policy-violation`; a client
/// that never acks must not pin unbounded server memory.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

// =============================================================================
// Network Constants
// =============================================================================

/// Default maximum connections per client IP address.
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 100;

/// Default maximum total C2S connections. 0 = unlimited.
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 10_000;

// =============================================================================
// Cluster Constants
// =============================================================================

/// KV prefix under which member records are published.
///
/// Layout: `i://<instance_id>` → `"a=<host:port> cv=<api-version>"`.
pub const MEMBER_KEY_PREFIX: &str = "i://";

/// KV prefix under which bound resource records are published.
///
/// Layout: `r://<user>/<resource>` → serialized [`ResourceDesc`].
///
/// [`ResourceDesc`]: crate::cluster::directory::ResourceDesc
pub const RESOURCE_KEY_PREFIX: &str = "r://";

/// KV prefix reserved for external component registration.
pub const COMPONENT_KEY_PREFIX: &str = "c://";

/// Default TTL lease applied to member and resource records.
///
/// Kept below the hibernate window so a crashed owner's records expire
/// before its hibernating queues would have been resumable.
pub const DEFAULT_KV_LEASE_TTL_SECS: u64 = 40;

/// Default interval at which leased KV records are refreshed.
pub const DEFAULT_KV_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// How long a failing resource descriptor is blacklisted before the
/// router may select it again.
pub const ROUTE_BLACKLIST_WINDOW: Duration = Duration::from_millis(200);

/// Maximum size of a single cluster RPC frame (64 MiB).
///
/// A transferred queue carries up to `max_queue_size` stanzas, each
/// bounded by `max_stanza_size`; the default product stays inside this
/// bound.
pub const MAX_RPC_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Default timeout for dialing a peer instance.
pub const DEFAULT_CLUSTER_DIAL_TIMEOUT_SECS: u64 = 5;

/// Default deadline for a single cluster RPC round trip.
pub const DEFAULT_CLUSTER_REQ_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_lease_expires_inside_hibernate_window() {
        // A crashed owner's records must not outlive its hibernating
        // queue window.
        assert!(DEFAULT_KV_LEASE_TTL_SECS < DEFAULT_HIBERNATE_TIME_SECS);
        assert!(DEFAULT_KV_HEARTBEAT_INTERVAL_SECS < DEFAULT_KV_LEASE_TTL_SECS);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_queue_bounds_are_reasonable() {
        assert!(DEFAULT_MAX_QUEUE_SIZE >= 1);
        assert!(DEFAULT_MAX_QUEUE_SIZE * DEFAULT_MAX_STANZA_SIZE <= MAX_RPC_FRAME_SIZE);
    }

    #[test]
    fn test_kv_prefixes_are_distinct() {
        assert_ne!(MEMBER_KEY_PREFIX, RESOURCE_KEY_PREFIX);
        assert_ne!(MEMBER_KEY_PREFIX, COMPONENT_KEY_PREFIX);
        assert_ne!(RESOURCE_KEY_PREFIX, COMPONENT_KEY_PREFIX);
    }
}
