//! Error types for the cluster layer.
//!
//! # Error Handling Patterns
//!
//! The cluster layer uses two patterns based on operation criticality:
//!
//! **Fail-fast (propagate)** — operations whose failure must reach the
//! caller: joining the member list, publishing a resource record,
//! transferring a stream-management queue.
//!
//! **Best-effort (log and continue)** — operations where partial
//! failure is acceptable: watch-tick cache maintenance, presence
//! broadcast fan-out, closing links to departed peers.
//!
//! Stream-facing paths convert these into the crate error via `From`;
//! a client only ever observes typed XMPP conditions.

use std::io;

use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// KV, membership and peer RPC errors.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// The link to a peer instance is down or could not be dialed.
    #[error("peer unavailable: {instance_id}")]
    PeerUnavailable { instance_id: String },

    /// The peer's local router had no stream for the target.
    #[error("unknown resource")]
    UnknownResource,

    /// The requested record or queue does not exist.
    #[error("not found")]
    NotFound,

    /// A KV value or RPC frame failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// An inbound or outbound RPC frame exceeded the size bound.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The target instance is not in the member directory.
    #[error("unknown member: {0}")]
    UnknownMember(String),

    /// A deadline attached to the operation elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl From<io::Error> for ClusterError {
    fn from(e: io::Error) -> Self {
        ClusterError::Io(e.kind())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: ClusterError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, ClusterError::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_display_carries_instance_id() {
        let err = ClusterError::PeerUnavailable {
            instance_id: "node-7".into(),
        };
        assert!(err.to_string().contains("node-7"));
    }
}
