//! In-memory stream mock.
//!
//! Implements [`C2sStream`] with recorded sends and disconnects, so the
//! router, stream-management and cluster layers can be exercised
//! without a transport. Used by the crate's own tests and available to
//! embedders for theirs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::info::InfoMap;
use crate::jid::Jid;
use crate::xmpp::{Element, StreamErrorCondition};

use super::stream::C2sStream;

/// A recorded outbound element.
#[derive(Debug, Clone)]
pub struct SentElement {
    pub element: Element,
    /// Whether the send was expected to fire `ElementSent`.
    pub tracked: bool,
}

/// Scriptable [`C2sStream`] implementation.
pub struct MockStream {
    id: u64,
    jid: RwLock<Option<Jid>>,
    info: RwLock<InfoMap>,
    bound: AtomicBool,
    hibernated: AtomicBool,
    sent: Mutex<Vec<SentElement>>,
    disconnects: Mutex<Vec<StreamErrorCondition>>,
}

impl MockStream {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            jid: RwLock::new(None),
            info: RwLock::new(InfoMap::new()),
            bound: AtomicBool::new(false),
            hibernated: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    /// A stream already past resource binding.
    pub fn bound(id: u64, jid: &str) -> Arc<Self> {
        let stream = Self::new(id);
        *stream.jid.write().unwrap() = Some(jid.parse().expect("valid jid"));
        stream.bound.store(true, Ordering::SeqCst);
        stream
    }

    pub fn set_hibernated(&self, hibernated: bool) {
        self.hibernated.store(hibernated, Ordering::SeqCst);
    }

    /// Every element sent so far, tracked or not.
    pub fn sent(&self) -> Vec<Element> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.element.clone())
            .collect()
    }

    pub fn sent_detailed(&self) -> Vec<SentElement> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn disconnects(&self) -> Vec<StreamErrorCondition> {
        self.disconnects.lock().unwrap().clone()
    }
}

#[async_trait]
impl C2sStream for MockStream {
    fn id(&self) -> u64 {
        self.id
    }

    fn jid(&self) -> Option<Jid> {
        self.jid.read().unwrap().clone()
    }

    fn info(&self) -> InfoMap {
        self.info.read().unwrap().clone()
    }

    async fn set_info_value(&self, key: &str, value: &str) {
        self.info.write().unwrap().set(key, value);
    }

    fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    fn is_hibernated(&self) -> bool {
        self.hibernated.load(Ordering::SeqCst)
    }

    async fn send_element(&self, element: Element) -> Result<()> {
        self.sent.lock().unwrap().push(SentElement {
            element,
            tracked: true,
        });
        Ok(())
    }

    async fn send_element_untracked(&self, element: Element) -> Result<()> {
        self.sent.lock().unwrap().push(SentElement {
            element,
            tracked: false,
        });
        Ok(())
    }

    async fn disconnect(&self, condition: StreamErrorCondition) {
        self.disconnects.lock().unwrap().push(condition);
        self.bound.store(false, Ordering::SeqCst);
    }

    async fn resume(&self, jid: Jid, _presence: Option<Element>, info: InfoMap) -> Result<()> {
        *self.jid.write().unwrap() = Some(jid);
        *self.info.write().unwrap() = info;
        self.bound.store(true, Ordering::SeqCst);
        self.hibernated.store(false, Ordering::SeqCst);
        Ok(())
    }
}
