//! Cluster membership, replicated directories and peer RPC.
//!
//! Every node publishes its member record and its bound resources into
//! a watched KV prefix store; all nodes mirror both prefixes into
//! in-memory caches. Stanzas for remote resources and stream-management
//! queue hand-offs travel over lazily-dialed peer links.

pub mod directory;
pub mod error;
pub mod instance;
pub mod kv;
pub mod link;
pub mod member;
pub mod rpc;
pub mod server;

pub use directory::{KvResourceDirectory, ResourceDesc};
pub use error::{ClusterError, ClusterResult};
pub use instance::LocalInstance;
pub use link::ClusterLinkManager;
pub use member::{ApiVersion, KvMemberList, Member};
pub use server::ClusterServer;
