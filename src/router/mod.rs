//! Stanza routing.
//!
//! The global router fronts the whole delivery surface: it enforces the
//! served-host policy, resolves the target against the resource
//! directory, and dispatches local-direct, same-cluster-remote or
//! federated-remote. Policy hooks run in order before dispatch:
//! `PreRoute` (a blocklist may halt), `WillRoute` (carbons may
//! duplicate), `DidRoute` (telemetry). A halted hook counts as a
//! successful dispatch — the handler owned the stanza.

pub mod cluster;
pub mod local;
pub mod s2s;
pub mod stream;
pub mod test_support;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cluster::directory::{KvResourceDirectory, ResourceDesc};
use crate::cluster::error::ClusterError;
use crate::constants::ROUTE_BLACKLIST_WINDOW;
use crate::hook::{ExecutionContext, HookInfo, HookKind, Hooks, RouteInfo};
use crate::xmpp::{
    Stanza, StanzaErrorCondition, StanzaKind, error_reply, presence_is_available,
    presence_priority,
};

pub use cluster::ClusterRouter;
pub use local::LocalRouter;
pub use s2s::S2sOutProvider;

/// Routing failures surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No bound stream anywhere in the cluster for the target.
    #[error("unknown resource")]
    UnknownResource,

    /// The remote domain could not be reached over S2S.
    #[error("remote server not found")]
    RemoteServerNotFound,

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Cluster-aware stanza router.
pub struct GlobalRouter {
    hosts: Vec<String>,
    local_instance_id: String,
    hooks: Arc<Hooks>,
    directory: Arc<KvResourceDirectory>,
    local: Arc<LocalRouter>,
    cluster: Arc<ClusterRouter>,
    s2s: Option<Arc<S2sOutProvider>>,
    // (instance_id, full jid) → expiry of the blacklist entry
    blacklist: Mutex<HashMap<(String, String), Instant>>,
}

impl GlobalRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: Vec<String>,
        local_instance_id: impl Into<String>,
        hooks: Arc<Hooks>,
        directory: Arc<KvResourceDirectory>,
        local: Arc<LocalRouter>,
        cluster: Arc<ClusterRouter>,
        s2s: Option<Arc<S2sOutProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts,
            local_instance_id: local_instance_id.into(),
            hooks,
            directory,
            local,
            cluster,
            s2s,
            blacklist: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_local_host(&self, domain: &str) -> bool {
        self.hosts.iter().any(|h| h == domain)
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn local_router(&self) -> &Arc<LocalRouter> {
        &self.local
    }

    /// Route one stanza to wherever its `to` address lives.
    pub async fn route(&self, stanza: Stanza) -> Result<(), RouteError> {
        // PreRoute: a blocklist handler may own the stanza here.
        let stanza = match self.run_route_hook(HookKind::PreRoute, stanza).await {
            Some(stanza) => stanza,
            None => return Ok(()),
        };
        // WillRoute: carbons and friends may duplicate or rewrite.
        let stanza = match self.run_route_hook(HookKind::WillRoute, stanza).await {
            Some(stanza) => stanza,
            None => return Ok(()),
        };

        let Some(to) = stanza.to().cloned() else {
            tracing::warn!(kind = ?stanza.kind(), "dropping stanza without recipient");
            return Ok(());
        };

        let result = if !self.is_local_host(to.domain()) {
            self.route_federated(stanza.clone()).await
        } else if to.is_bare() {
            self.route_bare(&stanza).await
        } else {
            self.route_full(&stanza).await
        };

        if result.is_ok() {
            let mut ctx = ExecutionContext::new(HookInfo::Route(RouteInfo { stanza }));
            if let Err(e) = self.hooks.run(HookKind::DidRoute, &mut ctx).await {
                tracing::warn!(error = %e, "did-route hook failed");
            }
        }
        result
    }

    /// Run a routing hook; `None` means a handler halted (or failed)
    /// and the stanza is considered dispatched.
    async fn run_route_hook(&self, kind: HookKind, stanza: Stanza) -> Option<Stanza> {
        let mut ctx = ExecutionContext::new(HookInfo::Route(RouteInfo { stanza }));
        match self.hooks.run(kind, &mut ctx).await {
            Ok(halted) => {
                let HookInfo::Route(info) = ctx.info else {
                    return None;
                };
                if halted { None } else { Some(info.stanza) }
            }
            Err(e) => {
                tracing::warn!(kind = ?kind, error = %e, "routing hook failed, stanza owned by hook");
                None
            }
        }
    }

    async fn route_federated(&self, stanza: Stanza) -> Result<(), RouteError> {
        match &self.s2s {
            Some(provider) => match provider.send(stanza.clone()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.reply_error(&stanza, StanzaErrorCondition::RemoteServerNotFound)
                        .await;
                    Err(e)
                }
            },
            None => {
                self.reply_error(&stanza, StanzaErrorCondition::RemoteServerNotFound)
                    .await;
                Err(RouteError::RemoteServerNotFound)
            }
        }
    }

    /// Bare JID: duplicate-deliver to every available resource.
    async fn route_bare(&self, stanza: &Stanza) -> Result<(), RouteError> {
        let user = stanza
            .to()
            .and_then(|j| j.node())
            .unwrap_or_default()
            .to_owned();

        let available: Vec<ResourceDesc> = self
            .directory
            .list(&user)
            .into_iter()
            .filter(|desc| {
                desc.presence
                    .as_ref()
                    .is_some_and(|p| presence_is_available(p) && presence_priority(p) >= 0)
            })
            .collect();

        if available.is_empty() {
            return self.handle_unreachable(stanza).await;
        }

        for desc in available {
            if let Err(e) = self.deliver_to_desc(stanza, &desc, true).await {
                tracing::warn!(target = %desc.jid, error = %e, "bare fan-out delivery failed");
            }
        }
        Ok(())
    }

    /// Full JID: single-resource resolution with one blacklisted retry.
    async fn route_full(&self, stanza: &Stanza) -> Result<(), RouteError> {
        let to = stanza.to().expect("full routing requires a recipient");
        let user = to.node().unwrap_or_default().to_owned();
        let resource = to.resource().unwrap_or_default().to_owned();

        let mut attempts = 0;
        loop {
            attempts += 1;

            let desc = match self.directory.get(&user, &resource).await {
                Ok(desc) => desc,
                Err(e) => {
                    tracing::warn!(error = %e, "directory lookup failed");
                    None
                }
            };
            let Some(desc) = desc else {
                return self.handle_unreachable(stanza).await;
            };
            if self.is_blacklisted(&desc) {
                return self.handle_unreachable(stanza).await;
            }

            match self.deliver_to_desc(stanza, &desc, false).await {
                Ok(()) => return Ok(()),
                Err(RouteError::Cluster(
                    ClusterError::PeerUnavailable { .. } | ClusterError::UnknownResource,
                ))
                | Err(RouteError::UnknownResource)
                    if attempts == 1 =>
                {
                    // The descriptor may be stale (resume in flight);
                    // blacklist it briefly and re-resolve once.
                    self.add_to_blacklist(&desc);
                    continue;
                }
                Err(_) => return self.handle_unreachable(stanza).await,
            }
        }
    }

    async fn deliver_to_desc(
        &self,
        stanza: &Stanza,
        desc: &ResourceDesc,
        log_failure: bool,
    ) -> Result<(), RouteError> {
        if desc.instance_id == self.local_instance_id {
            let result = self
                .local
                .deliver_to(desc.user(), desc.resource(), stanza.clone())
                .await;
            if let (Err(e), true) = (&result, log_failure) {
                tracing::debug!(target = %desc.jid, error = %e, "local delivery failed");
            }
            result
        } else {
            self.cluster.forward(stanza, desc).await.map_err(RouteError::from)
        }
    }

    /// Unknown or unreachable recipient, by stanza kind: iq requests get
    /// `service-unavailable`, messages go to the offline hook, presences
    /// are dropped.
    async fn handle_unreachable(&self, stanza: &Stanza) -> Result<(), RouteError> {
        match stanza.kind() {
            StanzaKind::Iq if stanza.is_iq_request() => {
                self.reply_error(stanza, StanzaErrorCondition::ServiceUnavailable)
                    .await;
            }
            StanzaKind::Message => {
                let mut ctx = ExecutionContext::new(HookInfo::Route(RouteInfo {
                    stanza: stanza.clone(),
                }));
                if let Err(e) = self.hooks.run(HookKind::OfflineMessage, &mut ctx).await {
                    tracing::warn!(error = %e, "offline message hook failed");
                }
            }
            _ => {
                tracing::debug!(kind = ?stanza.kind(), "dropping stanza for unreachable recipient");
            }
        }
        Ok(())
    }

    async fn reply_error(&self, original: &Stanza, condition: StanzaErrorCondition) {
        let Some(reply) = error_reply(original, condition) else {
            return;
        };
        if let Err(e) = Box::pin(self.route(reply)).await {
            tracing::debug!(error = %e, "failed to route error reply");
        }
    }

    fn is_blacklisted(&self, desc: &ResourceDesc) -> bool {
        let key = (desc.instance_id.clone(), desc.jid.to_string());
        let mut blacklist = self.blacklist.lock().expect("blacklist lock poisoned");
        let now = Instant::now();
        blacklist.retain(|_, expiry| *expiry > now);
        blacklist.contains_key(&key)
    }

    fn add_to_blacklist(&self, desc: &ResourceDesc) {
        let key = (desc.instance_id.clone(), desc.jid.to_string());
        let mut blacklist = self.blacklist.lock().expect("blacklist lock poisoned");
        blacklist.insert(key, Instant::now() + ROUTE_BLACKLIST_WINDOW);
    }
}
