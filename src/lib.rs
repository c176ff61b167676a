//! # Chorus
//! Horizontally scalable XMPP server core.
//!
//! This crate provides the stanza-routing and session-continuity
//! subsystem of an XMPP (RFC 6120/6121) server: the C2S stream state
//! machine, a cluster-aware router over a replicated resource
//! directory, and stream management (XEP-0198) with queues that survive
//! disconnects and migrate between cluster nodes on resume.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/) and [tracing](https://docs.rs/tracing)
//! - Be a building block for complete XMPP deployments
//!
//! ## Architecture
//!
//! Every instance publishes its member record and the descriptors of
//! its bound resources into a watched key/value store (the [`kv`]
//! contract — in-memory for tests and single nodes, etcd-class for
//! real clusters). All instances mirror both prefixes, so the
//! [`router::GlobalRouter`] can decide per stanza: deliver to a local
//! stream, forward over a peer link to the owning instance, or
//! federate over S2S.
//!
//! A stream that enabled stream management does not die with its TCP
//! connection: it hibernates, deliveries divert into its
//! [`sm::queue::StreamQueue`], and a later `<resume/>` — on any node of
//! the cluster — adopts the queue, replays the unacknowledged tail and
//! carries on. Cross-node resume moves the queue with an atomic
//! `TransferQueue` RPC, so a queue is owned by at most one node at any
//! time.
//!
//! ## Getting started
//!
//! A node wires the cluster plane; a C2S listener serves clients. The
//! embedder supplies the XML parser ([`xmpp::ElementParser`]) and the
//! credential backend ([`server::sasl::Authenticator`]):
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chorus::cluster::kv::memory::MemoryKv;
//! use chorus::config::Config;
//! use chorus::node::Node;
//! use chorus::server::C2sServer;
//! use chorus::server::sasl::StaticAuthenticator;
//!
//! # fn my_parser_factory() -> chorus::server::ParserFactory { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     chorus::telemetry::init_logging(chorus::telemetry::LogFormat::from_env())?;
//!
//!     let mut config = Config::default();
//!     config.hosts = vec!["chorus.im".into()];
//!
//!     let authenticator = Arc::new(StaticAuthenticator::new());
//!     let node = Node::start(config.clone(), Arc::new(MemoryKv::new()), authenticator, None).await?;
//!
//!     let server = C2sServer::bind(config.c2s, node.session_deps(), my_parser_factory()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod constants;
pub mod error;
pub mod hook;
pub mod info;
pub mod jid;
pub mod node;
pub mod router;
pub mod server;
pub mod sm;
pub mod telemetry;
pub mod xmpp;

pub use error::{Error, Result};

/// Commonly used types.
pub mod prelude {
    pub use crate::cluster::kv::KV;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::hook::{HookKind, HookOutcome, Hooks};
    pub use crate::jid::Jid;
    pub use crate::node::Node;
    pub use crate::router::GlobalRouter;
    pub use crate::server::{C2sServer, SessionDeps};
    pub use crate::xmpp::{Element, Stanza};
}
