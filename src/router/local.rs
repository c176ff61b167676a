//! Delivery to locally-bound streams.
//!
//! Holds the `(user, resource)` → stream table for this instance. A
//! delivery to a hibernated stream is intercepted and appended to its
//! stream-management queue instead of the (gone) transport.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;

use crate::sm::queue::QueueMap;
use crate::xmpp::{Stanza, StreamErrorCondition};

use super::RouteError;
use super::stream::C2sStream;

/// Router-table key for a bound stream.
pub fn bind_key(user: &str, resource: &str) -> String {
    format!("{user}/{resource}")
}

/// The per-instance stream table.
pub struct LocalRouter {
    streams: RwLock<HashMap<String, Arc<dyn C2sStream>>>,
    // Wired once at startup; deliveries to hibernated streams go here.
    queues: OnceCell<Arc<QueueMap>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            queues: OnceCell::new(),
        })
    }

    pub fn set_queue_map(&self, queues: Arc<QueueMap>) {
        let _ = self.queues.set(queues);
    }

    /// Register a bound stream, returning any stream it displaced
    /// (same full JID bound twice → conflict on the old one).
    pub fn register(&self, stream: Arc<dyn C2sStream>) -> Option<Arc<dyn C2sStream>> {
        let user = stream.username()?;
        let resource = stream.resource()?;
        let mut streams = self.streams.write().expect("router lock poisoned");
        streams.insert(bind_key(&user, &resource), stream)
    }

    /// Remove a stream, but only the exact one passed in; a concurrent
    /// re-bind of the same key is left untouched.
    pub fn unregister(&self, stream: &Arc<dyn C2sStream>) {
        let (Some(user), Some(resource)) = (stream.username(), stream.resource()) else {
            return;
        };
        let key = bind_key(&user, &resource);
        let mut streams = self.streams.write().expect("router lock poisoned");
        if streams
            .get(&key)
            .is_some_and(|s| s.id() == stream.id())
        {
            streams.remove(&key);
        }
    }

    pub fn get(&self, user: &str, resource: &str) -> Option<Arc<dyn C2sStream>> {
        self.streams
            .read()
            .expect("router lock poisoned")
            .get(&bind_key(user, resource))
            .cloned()
    }

    /// Snapshot of all registered streams, for broadcast fan-out.
    pub fn streams(&self) -> Vec<Arc<dyn C2sStream>> {
        self.streams
            .read()
            .expect("router lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Deliver a stanza to the stream bound to its full `to` JID.
    pub async fn deliver(&self, stanza: Stanza) -> Result<(), RouteError> {
        let to = stanza.to().ok_or(RouteError::UnknownResource)?;
        let (Some(user), Some(resource)) = (to.node(), to.resource()) else {
            return Err(RouteError::UnknownResource);
        };
        let (user, resource) = (user.to_owned(), resource.to_owned());
        self.deliver_to(&user, &resource, stanza).await
    }

    /// Deliver a stanza to an explicit `(user, resource)` target,
    /// regardless of the stanza's own `to` (bare-JID fan-out keeps the
    /// bare address on each copy).
    pub async fn deliver_to(
        &self,
        user: &str,
        resource: &str,
        stanza: Stanza,
    ) -> Result<(), RouteError> {
        let stream = self.get(user, resource).ok_or(RouteError::UnknownResource)?;

        if stream.is_hibernated() {
            let queue = self
                .queues
                .get()
                .and_then(|qm| qm.get(&bind_key(user, resource)))
                .ok_or(RouteError::UnknownResource)?;
            if queue.push(stanza).is_err() {
                tracing::info!(queue = %queue.key(), "hibernated queue overflow");
                stream.disconnect(StreamErrorCondition::PolicyViolation).await;
            }
            return Ok(());
        }

        // The stream may vanish between lookup and send.
        stream
            .send_element(stanza.into_element())
            .await
            .map_err(|_| RouteError::UnknownResource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_support::MockStream;
    use crate::xmpp::Element;

    fn stanza(to: &str) -> Stanza {
        Stanza::try_from(Element::builder("message").attr("to", to).build()).unwrap()
    }

    #[tokio::test]
    async fn test_deliver_to_registered_stream() {
        let router = LocalRouter::new();
        let stream = MockStream::bound(1, "alice@chorus.im/desk");
        router.register(stream.clone());

        router.deliver(stanza("alice@chorus.im/desk")).await.unwrap();
        assert_eq!(stream.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let router = LocalRouter::new();
        let err = router
            .deliver(stanza("alice@chorus.im/desk"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownResource));
    }

    #[tokio::test]
    async fn test_register_displaces_same_key() {
        let router = LocalRouter::new();
        let old = MockStream::bound(1, "alice@chorus.im/desk");
        let new = MockStream::bound(2, "alice@chorus.im/desk");

        assert!(router.register(old.clone()).is_none());
        let displaced = router.register(new).unwrap();
        assert_eq!(displaced.id(), 1);
    }

    #[tokio::test]
    async fn test_unregister_only_removes_exact_stream() {
        let router = LocalRouter::new();
        let old: Arc<dyn C2sStream> = MockStream::bound(1, "alice@chorus.im/desk");
        let new = MockStream::bound(2, "alice@chorus.im/desk");
        router.register(old.clone());
        router.register(new);

        // Old stream's delayed teardown must not drop the new binding.
        router.unregister(&old);
        assert_eq!(router.get("alice", "desk").unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_hibernated_delivery_goes_to_queue() {
        use crate::config::SmConfig;
        use crate::constants::SM_NONCE_LENGTH;
        use crate::sm::queue::{QueueMap, StreamQueue};

        let router = LocalRouter::new();
        let queues = QueueMap::new();
        router.set_queue_map(queues.clone());

        let stream = MockStream::bound(1, "alice@chorus.im/desk");
        stream.set_hibernated(true);
        router.register(stream.clone());

        let q = StreamQueue::new(
            "alice/desk",
            [1u8; SM_NONCE_LENGTH],
            SmConfig::default(),
            router.clone(),
        );
        queues.insert(q.clone());

        router.deliver(stanza("alice@chorus.im/desk")).await.unwrap();
        assert!(stream.sent().is_empty());
        assert_eq!(q.len(), 1);
        q.cancel_timers();
    }
}
