//! In-process KV backend.
//!
//! Single-store semantics with the full watched-map contract: monotonic
//! revisions, prefix watches and TTL leases enforced by a background
//! sweeper. Tests and single-node deployments use it directly; a
//! multi-node deployment swaps in a backend that talks to a real store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{KV, KvEntry, WatchEvent, WatchEventKind, WatchResp};
use crate::cluster::error::ClusterResult;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct StoredEntry {
    value: Vec<u8>,
    mod_revision: u64,
    expires_at: Option<Instant>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchResp>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, StoredEntry>,
    revision: u64,
    watchers: Vec<Watcher>,
}

impl State {
    fn notify(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|w| {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|ev| ev.key.starts_with(&w.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !w.tx.is_closed();
            }
            w.tx.send(WatchResp {
                    events: matching,
                    error: None,
                })
                .is_ok()
        });
    }
}

/// In-memory watched KV store with TTL leases.
pub struct MemoryKv {
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
}

impl MemoryKv {
    /// Create a store and start its lease sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let cancel = CancellationToken::new();

        let sweep_state = state.clone();
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        Self::sweep_expired(&sweep_state);
                    }
                }
            }
        });

        Self { state, cancel }
    }

    fn sweep_expired(state: &Arc<Mutex<State>>) {
        let now = Instant::now();
        let mut guard = state.lock().expect("kv lock poisoned");
        let expired: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut events = Vec::with_capacity(expired.len());
        for key in expired {
            guard.entries.remove(&key);
            tracing::debug!(key = %key, "lease expired");
            events.push(WatchEvent {
                key,
                kind: WatchEventKind::Del,
            });
        }
        guard.notify(events);
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryKv {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl KV for MemoryKv {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> ClusterResult<()> {
        let mut guard = self.state.lock().expect("kv lock poisoned");
        guard.revision += 1;
        let mod_revision = guard.revision;
        guard.entries.insert(
            key.to_owned(),
            StoredEntry {
                value: value.clone(),
                mod_revision,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        guard.notify(vec![WatchEvent {
            key: key.to_owned(),
            kind: WatchEventKind::Put {
                value,
                mod_revision,
            },
        }]);
        Ok(())
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<KvEntry>> {
        let guard = self.state.lock().expect("kv lock poisoned");
        Ok(guard.entries.get(key).and_then(|e| {
            if e.expires_at.is_some_and(|t| t <= Instant::now()) {
                return None; // expired, sweeper will emit the Del
            }
            Some(KvEntry {
                value: e.value.clone(),
                mod_revision: e.mod_revision,
            })
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> ClusterResult<HashMap<String, KvEntry>> {
        let guard = self.state.lock().expect("kv lock poisoned");
        let now = Instant::now();
        Ok(guard
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, e)| {
                (
                    k.clone(),
                    KvEntry {
                        value: e.value.clone(),
                        mod_revision: e.mod_revision,
                    },
                )
            })
            .collect())
    }

    async fn del(&self, key: &str) -> ClusterResult<()> {
        let mut guard = self.state.lock().expect("kv lock poisoned");
        if guard.entries.remove(key).is_some() {
            guard.notify(vec![WatchEvent {
                key: key.to_owned(),
                kind: WatchEventKind::Del,
            }]);
        }
        Ok(())
    }

    fn watch(&self, prefix: &str, include_existing: bool) -> mpsc::UnboundedReceiver<WatchResp> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.state.lock().expect("kv lock poisoned");
        if include_existing {
            let now = Instant::now();
            let events: Vec<WatchEvent> = guard
                .entries
                .range(prefix.to_owned()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .filter(|(_, e)| !e.expires_at.is_some_and(|t| t <= now))
                .map(|(k, e)| WatchEvent {
                    key: k.clone(),
                    kind: WatchEventKind::Put {
                        value: e.value.clone(),
                        mod_revision: e.mod_revision,
                    },
                })
                .collect();
            if !events.is_empty() {
                let _ = tx.send(WatchResp {
                    events,
                    error: None,
                });
            }
        }
        guard.watchers.push(Watcher {
            prefix: prefix.to_owned(),
            tx,
        });
        rx
    }
}
