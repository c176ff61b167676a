//! Watched key/value contract.
//!
//! The member and resource directories replicate through a
//! strongly-consistent key prefix store with a change stream. The
//! concrete backend (etcd, Redis, …) stays outside the core; components
//! depend only on this trait. The crate ships [`MemoryKv`], an
//! in-process implementation used by tests and single-node deployments.
//!
//! All records are TTL-leased: a record whose lease is not refreshed
//! before expiry is deleted and a `Del` event is emitted, so watchers
//! forget crashed owners without any extra failure detector.
//!
//! [`MemoryKv`]: memory::MemoryKv

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::{ClusterError, ClusterResult};

/// A stored value together with its modification revision.
///
/// Revisions increase monotonically store-wide; they order concurrent
/// writers of the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub mod_revision: u64,
}

/// A single change observed by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Put { value: Vec<u8>, mod_revision: u64 },
    Del,
}

/// A batch of changes delivered to a watcher.
#[derive(Debug, Clone, Default)]
pub struct WatchResp {
    pub events: Vec<WatchEvent>,
    pub error: Option<ClusterError>,
}

/// The watched key/value store contract.
#[async_trait]
pub trait KV: Send + Sync {
    /// Write a key. `ttl` attaches a lease; re-putting refreshes it.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> ClusterResult<()>;

    /// Authoritative single-key read.
    async fn get(&self, key: &str) -> ClusterResult<Option<KvEntry>>;

    /// Authoritative read of every key under a prefix.
    async fn get_prefix(&self, prefix: &str) -> ClusterResult<HashMap<String, KvEntry>>;

    /// Unconditional delete. Deleting an absent key is not an error.
    async fn del(&self, key: &str) -> ClusterResult<()>;

    /// Subscribe to changes under a prefix.
    ///
    /// With `include_existing`, the first response replays the current
    /// contents as `Put` events, so a watcher can seed its cache and
    /// follow changes from one subscription.
    fn watch(&self, prefix: &str, include_existing: bool) -> mpsc::UnboundedReceiver<WatchResp>;
}
