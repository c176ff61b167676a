//! Ack-gated stream queues and the process-wide queue map.
//!
//! One [`StreamQueue`] exists per stream-management-enabled session. It
//! owns the unacknowledged outbound elements, both XEP-0198 counters,
//! the resume nonce, and the request-ack/hibernation timers. The queue
//! refers to its stream only by lookup key into the local router table,
//! so a resume can swap streams without fixing up back-pointers, and
//! the queue can outlive its stream while hibernated.
//!
//! Invariants:
//! - element `h` values are strictly increasing with no gaps, and the
//!   last equals `out_h`;
//! - both counters are 32-bit and compared modularly;
//! - `cancel_timers` is idempotent and safe on a detached queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::rpc::{QueueElementSnapshot, QueueSnapshot};
use crate::config::SmConfig;
use crate::constants::{SM_NAMESPACE, SM_NONCE_LENGTH};
use crate::router::local::LocalRouter;
use crate::router::stream::C2sStream;
use crate::xmpp::{Element, Stanza, StreamErrorCondition};

/// `a <= b` in RFC 1982 serial arithmetic over u32.
pub fn seq_leq(a: u32, b: u32) -> bool {
    a == b || b.wrapping_sub(a) < (1 << 31)
}

/// `a < b` in serial arithmetic.
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < (1 << 31)
}

/// A queued outbound element and its sequence number.
#[derive(Debug, Clone)]
pub struct QueueElement {
    pub stanza: Stanza,
    pub h: u32,
}

/// Appending would exceed the configured queue bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream queue overflow")]
pub struct QueueOverflow;

/// The peer acknowledged a sequence number beyond `out_h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ack beyond outbound counter")]
pub struct AckOutOfRange;

struct Inner {
    elements: VecDeque<QueueElement>,
    in_h: u32,
    out_h: u32,
    // Bumped on every inbound <a/>; the ack-wait deadline compares it.
    acked_seq: u64,
    request_ack: Option<JoinHandle<()>>,
    hibernate: Option<JoinHandle<()>>,
}

/// Per-session XEP-0198 queue.
pub struct StreamQueue {
    key: String,
    nonce: [u8; SM_NONCE_LENGTH],
    cfg: SmConfig,
    router: Arc<LocalRouter>,
    inner: Mutex<Inner>,
}

impl StreamQueue {
    pub fn new(
        key: impl Into<String>,
        nonce: [u8; SM_NONCE_LENGTH],
        cfg: SmConfig,
        router: Arc<LocalRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            nonce,
            cfg,
            router,
            inner: Mutex::new(Inner {
                elements: VecDeque::new(),
                in_h: 0,
                out_h: 0,
                acked_seq: 0,
                request_ack: None,
                hibernate: None,
            }),
        })
    }

    /// Rebuild a queue from a transferred snapshot.
    pub fn from_snapshot(
        key: impl Into<String>,
        snapshot: QueueSnapshot,
        cfg: SmConfig,
        router: Arc<LocalRouter>,
    ) -> ClusterResult<Arc<Self>> {
        let nonce: [u8; SM_NONCE_LENGTH] = snapshot
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| ClusterError::Decode("bad nonce length".into()))?;
        let mut elements = VecDeque::with_capacity(snapshot.elements.len());
        for el in snapshot.elements {
            let stanza = Stanza::try_from(el.stanza)
                .map_err(|e| ClusterError::Decode(e.to_string()))?;
            elements.push_back(QueueElement { stanza, h: el.h });
        }
        Ok(Arc::new(Self {
            key: key.into(),
            nonce,
            cfg,
            router,
            inner: Mutex::new(Inner {
                elements,
                in_h: snapshot.in_h,
                out_h: snapshot.out_h,
                acked_seq: 0,
                request_ack: None,
                hibernate: None,
            }),
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn nonce(&self) -> &[u8; SM_NONCE_LENGTH] {
        &self.nonce
    }

    pub fn in_h(&self) -> u32 {
        self.lock().in_h
    }

    pub fn out_h(&self) -> u32 {
        self.lock().out_h
    }

    pub fn len(&self) -> usize {
        self.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().elements.is_empty()
    }

    /// Count one consumed inbound stanza.
    pub fn inc_in_h(&self) -> u32 {
        let mut inner = self.lock();
        inner.in_h = inner.in_h.wrapping_add(1);
        inner.in_h
    }

    /// Append an outbound stanza, assigning the next `h`, and arm the
    /// request-ack timer.
    pub fn push(self: &Arc<Self>, stanza: Stanza) -> Result<(), QueueOverflow> {
        {
            let mut inner = self.lock();
            if inner.elements.len() >= self.cfg.max_queue_size {
                return Err(QueueOverflow);
            }
            inner.out_h = inner.out_h.wrapping_add(1);
            let h = inner.out_h;
            inner.elements.push_back(QueueElement { stanza, h });
        }
        self.schedule_request_ack();
        Ok(())
    }

    /// Drop every element with `h ≤ n` (serial order).
    ///
    /// A value below the window is a no-op; a value beyond `out_h` is a
    /// protocol violation surfaced to the caller.
    pub fn ack_up_to(&self, n: u32) -> Result<(), AckOutOfRange> {
        let mut inner = self.lock();
        if seq_lt(inner.out_h, n) {
            return Err(AckOutOfRange);
        }
        while inner
            .elements
            .front()
            .is_some_and(|el| seq_leq(el.h, n))
        {
            inner.elements.pop_front();
        }
        inner.acked_seq += 1;
        if inner.elements.is_empty() {
            if let Some(handle) = inner.request_ack.take() {
                handle.abort();
            }
        }
        Ok(())
    }

    /// Clone the pending elements in order, for replay after resume.
    pub fn elements(&self) -> Vec<QueueElement> {
        self.lock().elements.iter().cloned().collect()
    }

    /// Wire-format snapshot for a cross-node transfer.
    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.lock();
        QueueSnapshot {
            elements: inner
                .elements
                .iter()
                .map(|el| QueueElementSnapshot {
                    stanza: el.stanza.element().clone(),
                    h: el.h,
                })
                .collect(),
            nonce: self.nonce.to_vec(),
            in_h: inner.in_h,
            out_h: inner.out_h,
        }
    }

    /// Abort both timers. Idempotent; safe on a detached queue.
    pub fn cancel_timers(&self) {
        let mut inner = self.lock();
        if let Some(handle) = inner.request_ack.take() {
            handle.abort();
        }
        if let Some(handle) = inner.hibernate.take() {
            handle.abort();
        }
    }

    /// Install the hibernation GC task (owned by the SM manager).
    pub fn set_hibernate_task(&self, handle: JoinHandle<()>) {
        let mut inner = self.lock();
        if let Some(old) = inner.hibernate.replace(handle) {
            old.abort();
        }
    }

    pub fn cancel_hibernate_task(&self) {
        let mut inner = self.lock();
        if let Some(handle) = inner.hibernate.take() {
            handle.abort();
        }
    }

    /// Arm (or re-arm) the request-ack timer: after
    /// `request_ack_interval` of silence transmit `<r/>`, then give the
    /// client `wait_for_ack_timeout` before disconnecting it with
    /// `connection-timeout`.
    pub fn schedule_request_ack(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.cfg.request_ack_interval()).await;

            let (pending, acked_before) = {
                let inner = this.lock();
                (!inner.elements.is_empty(), inner.acked_seq)
            };
            if !pending {
                return;
            }
            if let Some(stream) = this.attached_stream() {
                if !stream.is_hibernated() {
                    let r = Element::builder("r").ns(SM_NAMESPACE).build();
                    if let Err(e) = stream.send_element_untracked(r).await {
                        tracing::debug!(queue = %this.key, error = %e, "failed to transmit ack request");
                    }
                }
            }

            tokio::time::sleep(this.cfg.wait_for_ack_timeout()).await;

            let still_pending = {
                let inner = this.lock();
                !inner.elements.is_empty() && inner.acked_seq == acked_before
            };
            if still_pending {
                if let Some(stream) = this.attached_stream() {
                    if !stream.is_hibernated() {
                        tracing::info!(queue = %this.key, "no ack within deadline, disconnecting");
                        stream
                            .disconnect(StreamErrorCondition::ConnectionTimeout)
                            .await;
                    }
                }
            }
        });

        let mut inner = self.lock();
        if let Some(old) = inner.request_ack.replace(handle) {
            old.abort();
        }
    }

    /// The stream currently registered under this queue's key.
    pub fn attached_stream(&self) -> Option<Arc<dyn C2sStream>> {
        let (user, resource) = self.key.split_once('/')?;
        self.router.get(user, resource)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("queue lock poisoned")
    }
}

/// Process-wide map from queue key (`<user>/<resource>`) to queue.
///
/// Lookup, insert and detach are O(1) and atomic with respect to each
/// other; the atomic detach is what serializes two concurrent resumes
/// of the same session.
#[derive(Default)]
pub struct QueueMap {
    inner: Mutex<HashMap<String, Arc<StreamQueue>>>,
}

impl QueueMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, queue: Arc<StreamQueue>) {
        self.lock().insert(queue.key().to_owned(), queue);
    }

    pub fn get(&self, key: &str) -> Option<Arc<StreamQueue>> {
        self.lock().get(key).cloned()
    }

    /// Atomically remove and return the queue for `key`.
    pub fn detach(&self, key: &str) -> Option<Arc<StreamQueue>> {
        self.lock().remove(key)
    }

    /// Atomically remove the queue for `key` if `pred` accepts it.
    pub fn detach_if(
        &self,
        key: &str,
        pred: impl FnOnce(&StreamQueue) -> bool,
    ) -> Option<Arc<StreamQueue>> {
        let mut map = self.lock();
        if map.get(key).is_some_and(|q| pred(q.as_ref())) {
            map.remove(key)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<StreamQueue>>> {
        self.inner.lock().expect("queue map lock poisoned")
    }
}
