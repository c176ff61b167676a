//! Server-to-server outgoing streams.
//!
//! Stanzas addressed outside the served hosts are federated through an
//! outgoing S2S stream per remote domain, dialed on demand with
//! single-flight. Stream negotiation (dialback, TLS) lives behind the
//! [`S2sDialer`] seam; the core only keys, caches and feeds the
//! streams.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::xmpp::{Element, Stanza};

use super::RouteError;

/// An established outgoing S2S stream.
#[async_trait]
pub trait S2sOut: Send + Sync {
    async fn send_element(&self, element: Element) -> Result<()>;
}

/// Dials and negotiates outgoing S2S streams.
#[async_trait]
pub trait S2sDialer: Send + Sync {
    async fn dial(&self, sender_domain: &str, remote_domain: &str) -> Result<Arc<dyn S2sOut>>;
}

type OutSlot = Arc<Mutex<Option<Arc<dyn S2sOut>>>>;

/// Dial-on-demand S2S outgoing streams keyed by remote domain.
pub struct S2sOutProvider {
    dialer: Arc<dyn S2sDialer>,
    sender_domain: String,
    slots: DashMap<String, OutSlot>,
}

impl S2sOutProvider {
    pub fn new(dialer: Arc<dyn S2sDialer>, sender_domain: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            sender_domain: sender_domain.into(),
            slots: DashMap::new(),
        })
    }

    /// Send a stanza to its remote domain, dialing if needed.
    pub async fn send(&self, stanza: Stanza) -> std::result::Result<(), RouteError> {
        let domain = stanza
            .to()
            .map(|j| j.domain().to_owned())
            .ok_or(RouteError::RemoteServerNotFound)?;

        let slot = self.slots.entry(domain.clone()).or_default().clone();

        let mut guard = slot.lock().await;
        if guard.is_none() {
            let out = self
                .dialer
                .dial(&self.sender_domain, &domain)
                .await
                .map_err(|e| {
                    tracing::warn!(remote_domain = %domain, error = %e, "failed to dial remote server");
                    RouteError::RemoteServerNotFound
                })?;
            tracing::info!(remote_domain = %domain, "opened outgoing s2s stream");
            *guard = Some(out);
        }
        let out = guard.as_ref().expect("slot just filled").clone();
        drop(guard);

        out.send_element(stanza.into_element()).await.map_err(|e| {
            tracing::warn!(remote_domain = %domain, error = %e, "s2s send failed");
            // Drop the broken stream so the next send re-dials.
            self.slots.remove(&domain);
            RouteError::RemoteServerNotFound
        })
    }
}
