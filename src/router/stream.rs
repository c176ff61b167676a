//! The stream contract the routers deliver to.
//!
//! The router table holds trait objects rather than concrete sessions,
//! so the stream-management layer, cluster RPC server and tests can all
//! stand behind the same seam.

use async_trait::async_trait;

use crate::error::Result;
use crate::info::InfoMap;
use crate::jid::Jid;
use crate::xmpp::{Element, StreamErrorCondition};

/// A client-to-server stream as seen by routers and hook handlers.
#[async_trait]
pub trait C2sStream: Send + Sync {
    /// Stream id, unique per process lifetime.
    fn id(&self) -> u64;

    /// The bound JID, once resource binding completed.
    fn jid(&self) -> Option<Jid>;

    fn username(&self) -> Option<String> {
        self.jid().and_then(|j| j.node().map(str::to_owned))
    }

    fn resource(&self) -> Option<String> {
        self.jid().and_then(|j| j.resource().map(str::to_owned))
    }

    /// Snapshot of the stream's info map.
    fn info(&self) -> InfoMap;

    async fn set_info_value(&self, key: &str, value: &str);

    fn is_bound(&self) -> bool;

    fn is_hibernated(&self) -> bool;

    /// Enqueue an element on the send channel. The `ElementSent` hook
    /// fires once the transport write succeeds.
    async fn send_element(&self, element: Element) -> Result<()>;

    /// Enqueue an element without firing `ElementSent`.
    ///
    /// Used for stream-management replay, whose elements already carry
    /// queue sequence numbers.
    async fn send_element_untracked(&self, element: Element) -> Result<()>;

    /// Close the stream with a stream error. Safe on hibernated
    /// streams, where it degrades to state cleanup.
    async fn disconnect(&self, condition: StreamErrorCondition);

    /// Adopt a resumed identity: set the JID and info map, enter the
    /// bound state and re-register with the directory.
    async fn resume(&self, jid: Jid, presence: Option<Element>, info: InfoMap) -> Result<()>;
}
