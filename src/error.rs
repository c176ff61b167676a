//! Crate-level errors.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Stream/Protocol Layer (`crate::error`)
//!
//! - [`Error`]: connection, framing and negotiation errors
//! - XMPP-visible failures are expressed through the typed conditions in
//!   [`crate::xmpp`] (stream errors, stanza errors) rather than through
//!   this enum; a client never sees an internal error string.
//!
//! ## Cluster Layer (`crate::cluster::error`)
//!
//! - [`ClusterError`]: KV, membership and peer RPC errors
//! - Convertible into [`Error`] via `From`, allowing cluster failures to
//!   propagate through stream-facing paths.
//!
//! [`ClusterError`]: crate::cluster::ClusterError

use std::{io, result};

use thiserror::Error as ThisError;

use crate::xmpp::StreamErrorCondition;

pub type Result<T> = result::Result<T, Error>;

/// Stream and connection level errors.
#[derive(Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// The transport produced bytes the element parser rejected.
    #[error("parse error: {0}")]
    Parse(String),

    /// The peer violated the stream protocol; carries the condition the
    /// stream was (or is about to be) closed with.
    #[error("stream error: {0}")]
    Stream(StreamErrorCondition),

    /// A deadline attached to a blocking call elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The stream send channel or transport is gone.
    #[error("stream closed")]
    Closed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A cluster-layer failure surfaced through a stream-facing path.
    #[error(transparent)]
    Cluster(#[from] crate::cluster::ClusterError),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_is_preserved() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        match err {
            Error::Io(kind) => assert_eq!(kind, io::ErrorKind::ConnectionReset),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stream_error_display_names_condition() {
        let err = Error::Stream(StreamErrorCondition::PolicyViolation);
        assert!(err.to_string().contains("policy-violation"));
    }

    #[test]
    fn test_cluster_error_converts() {
        let err: Error = crate::cluster::ClusterError::NotFound.into();
        assert!(matches!(err, Error::Cluster(_)));
    }
}
