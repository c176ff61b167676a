//! Replicated resource directory.
//!
//! Maps `(user, resource)` to the descriptor of the instance that owns
//! the bound stream. Records live under `r://<user>/<resource>` with a
//! TTL lease; every node watches the prefix and mirrors it into an
//! in-memory cache.
//!
//! Consistency: the cache is eventually consistent with the KV, but a
//! successful local `put` is readable by the same node immediately
//! (write-through). Duplicate `(user, resource)` records across two
//! instances resolve to the highest KV modification revision.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::constants::RESOURCE_KEY_PREFIX;
use crate::hook::{ExecutionContext, HookInfo, HookKind, Hooks, ResourceDirectoryInfo};
use crate::info::InfoMap;
use crate::jid::Jid;
use crate::xmpp::Element;

use super::error::ClusterResult;
use super::kv::{KV, WatchEvent, WatchEventKind};
use super::member::KvMemberList;

/// Descriptor of one bound resource somewhere in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub instance_id: String,
    pub jid: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Element>,
    #[serde(default, skip_serializing_if = "InfoMap::is_empty")]
    pub info: InfoMap,
}

impl ResourceDesc {
    pub fn user(&self) -> &str {
        self.jid.node().unwrap_or_default()
    }

    pub fn resource(&self) -> &str {
        self.jid.resource().unwrap_or_default()
    }
}

/// KV key for a bound resource.
pub fn resource_key(user: &str, resource: &str) -> String {
    format!("{RESOURCE_KEY_PREFIX}{user}/{resource}")
}

fn split_resource_key(key: &str) -> Option<(&str, &str)> {
    key.strip_prefix(RESOURCE_KEY_PREFIX)?.split_once('/')
}

#[derive(Debug, Clone)]
struct CachedResource {
    desc: ResourceDesc,
    mod_revision: u64,
}

/// KV-replicated, locally-cached resource directory.
pub struct KvResourceDirectory {
    kv: Arc<dyn KV>,
    hooks: Arc<Hooks>,
    members: Arc<KvMemberList>,
    lease_ttl: Duration,
    heartbeat_interval: Duration,
    // user → live resources for that user
    cache: RwLock<HashMap<String, Vec<CachedResource>>>,
    cancel: CancellationToken,
}

impl KvResourceDirectory {
    pub fn new(
        kv: Arc<dyn KV>,
        hooks: Arc<Hooks>,
        members: Arc<KvMemberList>,
        lease_ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            kv,
            hooks,
            members,
            lease_ttl,
            heartbeat_interval,
            cache: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    fn local_instance_id(&self) -> &str {
        &self.members.local_instance().id
    }

    /// Seed the cache and start the watch and lease-refresh tasks.
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        let mut watch_rx = self.kv.watch(RESOURCE_KEY_PREFIX, false);

        let seeded = self.kv.get_prefix(RESOURCE_KEY_PREFIX).await?;
        {
            let mut cache = self.cache.write().expect("directory lock poisoned");
            for (key, entry) in &seeded {
                match serde_json::from_slice::<ResourceDesc>(&entry.value) {
                    Ok(desc) => apply_put(&mut cache, desc, entry.mod_revision),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "failed to decode resource record");
                    }
                }
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    resp = watch_rx.recv() => {
                        let Some(resp) = resp else { return };
                        if let Some(err) = resp.error {
                            tracing::warn!(error = %err, "error occurred watching resource directory");
                            continue;
                        }
                        this.process_events(resp.events).await;
                    }
                }
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.heartbeat_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    _ = ticker.tick() => this.refresh_local_leases().await,
                }
            }
        });

        tracing::info!("started resource directory");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Publish a descriptor. Write-through: readable locally as soon as
    /// this returns.
    pub async fn put(&self, desc: ResourceDesc) -> ClusterResult<()> {
        let key = resource_key(desc.user(), desc.resource());
        let value = serde_json::to_vec(&desc)?;
        self.kv.put(&key, value, Some(self.lease_ttl)).await?;

        let mod_revision = self
            .kv
            .get(&key)
            .await?
            .map(|e| e.mod_revision)
            .unwrap_or_default();
        let mut cache = self.cache.write().expect("directory lock poisoned");
        apply_put(&mut cache, desc, mod_revision);
        Ok(())
    }

    /// Remove a descriptor unconditionally.
    pub async fn del(&self, user: &str, resource: &str) -> ClusterResult<()> {
        self.kv.del(&resource_key(user, resource)).await?;
        let mut cache = self.cache.write().expect("directory lock poisoned");
        apply_del(&mut cache, user, resource);
        Ok(())
    }

    /// Remove a descriptor only if this instance still owns it.
    ///
    /// Teardown paths use this so a node going through delayed cleanup
    /// cannot erase the record a resuming node just published.
    pub async fn del_if_owner(&self, user: &str, resource: &str) -> ClusterResult<()> {
        let owned = self
            .get(user, resource)
            .await?
            .is_some_and(|d| d.instance_id == self.local_instance_id());
        if owned {
            self.del(user, resource).await?;
        }
        Ok(())
    }

    /// Look up a single resource: cache first, authoritative KV read on
    /// miss.
    pub async fn get(&self, user: &str, resource: &str) -> ClusterResult<Option<ResourceDesc>> {
        {
            let cache = self.cache.read().expect("directory lock poisoned");
            if let Some(found) = cache
                .get(user)
                .and_then(|rs| rs.iter().find(|r| r.desc.resource() == resource))
            {
                return Ok(Some(found.desc.clone()));
            }
        }
        match self.kv.get(&resource_key(user, resource)).await? {
            None => Ok(None),
            Some(entry) => {
                let desc: ResourceDesc = serde_json::from_slice(&entry.value)?;
                let mut cache = self.cache.write().expect("directory lock poisoned");
                apply_put(&mut cache, desc.clone(), entry.mod_revision);
                Ok(Some(desc))
            }
        }
    }

    /// All resources bound for a bare JID.
    pub fn list(&self, user: &str) -> Vec<ResourceDesc> {
        let cache = self.cache.read().expect("directory lock poisoned");
        cache
            .get(user)
            .map(|rs| rs.iter().map(|r| r.desc.clone()).collect())
            .unwrap_or_default()
    }

    async fn process_events(&self, events: Vec<WatchEvent>) {
        let mut info = ResourceDirectoryInfo::default();
        {
            let mut cache = self.cache.write().expect("directory lock poisoned");
            for ev in events {
                match ev.kind {
                    WatchEventKind::Put {
                        value,
                        mod_revision,
                    } => match serde_json::from_slice::<ResourceDesc>(&value) {
                        Ok(desc) => {
                            apply_put(&mut cache, desc.clone(), mod_revision);
                            info.updated.push(desc);
                        }
                        Err(e) => {
                            tracing::warn!(key = %ev.key, error = %e, "failed to decode resource record");
                        }
                    },
                    WatchEventKind::Del => {
                        if let Some((user, resource)) = split_resource_key(&ev.key) {
                            apply_del(&mut cache, user, resource);
                        }
                        info.removed_keys.push(ev.key);
                    }
                }
            }

            // Opportunistic cleanup: forget descriptors whose owning
            // instance has left the member directory.
            let members = &self.members;
            for resources in cache.values_mut() {
                resources.retain(|r| {
                    let alive = members.is_alive(&r.desc.instance_id);
                    if !alive {
                        tracing::debug!(
                            jid = %r.desc.jid,
                            instance_id = %r.desc.instance_id,
                            "dropping resource of departed instance"
                        );
                        info.removed_keys
                            .push(resource_key(r.desc.user(), r.desc.resource()));
                    }
                    alive
                });
            }
            cache.retain(|_, rs| !rs.is_empty());
        }

        let mut ctx = ExecutionContext::new(HookInfo::ResourceDirectory(info));
        if let Err(e) = self
            .hooks
            .run(HookKind::ResourceDirectoryChanged, &mut ctx)
            .await
        {
            tracing::warn!(error = %e, "failed to process resource directory changes");
        }
    }

    async fn refresh_local_leases(&self) {
        let local: Vec<ResourceDesc> = {
            let cache = self.cache.read().expect("directory lock poisoned");
            cache
                .values()
                .flatten()
                .filter(|r| r.desc.instance_id == self.local_instance_id())
                .map(|r| r.desc.clone())
                .collect()
        };
        for desc in local {
            let key = resource_key(desc.user(), desc.resource());
            match serde_json::to_vec(&desc) {
                Ok(value) => {
                    if let Err(e) = self.kv.put(&key, value, Some(self.lease_ttl)).await {
                        tracing::warn!(key = %key, error = %e, "failed to refresh resource lease");
                    }
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to encode resource record"),
            }
        }
    }
}

fn apply_put(
    cache: &mut HashMap<String, Vec<CachedResource>>,
    desc: ResourceDesc,
    mod_revision: u64,
) {
    let resources = cache.entry(desc.user().to_owned()).or_default();
    match resources
        .iter_mut()
        .find(|r| r.desc.resource() == desc.resource())
    {
        Some(existing) => {
            // Most recent KV revision wins across duplicate owners.
            if mod_revision >= existing.mod_revision {
                existing.desc = desc;
                existing.mod_revision = mod_revision;
            }
        }
        None => resources.push(CachedResource { desc, mod_revision }),
    }
}

fn apply_del(cache: &mut HashMap<String, Vec<CachedResource>>, user: &str, resource: &str) {
    if let Some(resources) = cache.get_mut(user) {
        resources.retain(|r| r.desc.resource() != resource);
        if resources.is_empty() {
            cache.remove(user);
        }
    }
}
