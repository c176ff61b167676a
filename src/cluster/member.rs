//! Cluster member directory.
//!
//! Each instance publishes a member record under `i://<instance_id>`
//! with a TTL lease, watches the prefix to mirror the live set in
//! memory, and refreshes its own lease on a heartbeat. Lease expiry is
//! the only failure detector: a record that stops being refreshed
//! disappears, and every node observes the departure on its watch.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::constants::MEMBER_KEY_PREFIX;
use crate::hook::{ExecutionContext, HookInfo, HookKind, Hooks, MemberListInfo};

use super::error::{ClusterError, ClusterResult};
use super::instance::LocalInstance;
use super::kv::{KV, WatchEventKind};

/// Cluster RPC schema version advertised by this build.
pub const CLUSTER_API_VERSION: ApiVersion = ApiVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Semantic version of the cluster RPC schema a member speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ApiVersion {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('v')
            .ok_or_else(|| ClusterError::Decode(format!("bad api version: {s}")))?;
        let mut parts = rest.splitn(3, '.');
        let mut next = || -> Result<u32, ClusterError> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| ClusterError::Decode(format!("bad api version: {s}")))
        };
        Ok(ApiVersion {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

/// A live cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub api_version: ApiVersion,
}

impl Member {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn member_key(instance_id: &str) -> String {
    format!("{MEMBER_KEY_PREFIX}{instance_id}")
}

fn encode_member_value(local: &LocalInstance) -> String {
    format!("a={} cv={}", local.address(), CLUSTER_API_VERSION)
}

fn decode_member(key: &str, value: &str) -> ClusterResult<Member> {
    let instance_id = key
        .strip_prefix(MEMBER_KEY_PREFIX)
        .ok_or_else(|| ClusterError::Decode(format!("bad member key: {key}")))?;

    let mut addr = None;
    let mut api_version = None;
    for field in value.split_whitespace() {
        match field.split_once('=') {
            Some(("a", v)) => addr = Some(v),
            Some(("cv", v)) => api_version = Some(v.parse()?),
            _ => {}
        }
    }
    let addr = addr.ok_or_else(|| ClusterError::Decode(format!("bad member value: {value}")))?;
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ClusterError::Decode(format!("bad member address: {addr}")))?;
    let port = port
        .parse()
        .map_err(|_| ClusterError::Decode(format!("bad member port: {addr}")))?;

    Ok(Member {
        instance_id: instance_id.to_owned(),
        host: host.to_owned(),
        port,
        api_version: api_version
            .ok_or_else(|| ClusterError::Decode(format!("bad member value: {value}")))?,
    })
}

/// KV-replicated member directory.
pub struct KvMemberList {
    kv: Arc<dyn KV>,
    hooks: Arc<Hooks>,
    local: LocalInstance,
    lease_ttl: Duration,
    heartbeat_interval: Duration,
    members: RwLock<HashMap<String, Member>>,
    cancel: CancellationToken,
}

impl KvMemberList {
    pub fn new(
        kv: Arc<dyn KV>,
        hooks: Arc<Hooks>,
        local: LocalInstance,
        lease_ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            kv,
            hooks,
            local,
            lease_ttl,
            heartbeat_interval,
            members: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_instance(&self) -> &LocalInstance {
        &self.local
    }

    /// Join the cluster: register the local record, seed the member set
    /// and start the watch and heartbeat tasks.
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        self.join().await?;
        tracing::info!(
            instance_id = %self.local.id,
            address = %self.local.address(),
            "registered local instance"
        );

        // Subscribe before the seed read so no event is lost in between.
        let mut watch_rx = self.kv.watch(MEMBER_KEY_PREFIX, false);

        let seeded = self.kv.get_prefix(MEMBER_KEY_PREFIX).await?;
        let mut registered = Vec::new();
        {
            let mut members = self.members.write().expect("members lock poisoned");
            for (key, entry) in &seeded {
                if key == &member_key(&self.local.id) {
                    continue;
                }
                match decode_member(key, &String::from_utf8_lossy(&entry.value)) {
                    Ok(m) => {
                        members.insert(m.instance_id.clone(), m.clone());
                        registered.push(m);
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "failed to decode cluster member");
                    }
                }
            }
        }
        self.run_hook(MemberListInfo {
            registered,
            unregistered_keys: Vec::new(),
        })
        .await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    resp = watch_rx.recv() => {
                        let Some(resp) = resp else { return };
                        if let Some(err) = resp.error {
                            tracing::warn!(error = %err, "error occurred watching memberlist");
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
            ticker.tick().await; // immediate first tick, already joined
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = this.join().await {
                            tracing::warn!(error = %e, "failed to refresh member lease");
                        }
                    }
                }
            }
        });

        tracing::info!("started memberlist");
        Ok(())
    }

    /// Leave the cluster: stop the background tasks and unregister.
    pub async fn stop(&self) -> ClusterResult<()> {
        self.cancel.cancel();
        self.kv.del(&member_key(&self.local.id)).await?;
        tracing::info!(instance_id = %self.local.id, "unregistered local instance");
        Ok(())
    }

    pub fn get_member(&self, instance_id: &str) -> Option<Member> {
        self.members
            .read()
            .expect("members lock poisoned")
            .get(instance_id)
            .cloned()
    }

    pub fn get_members(&self) -> HashMap<String, Member> {
        self.members.read().expect("members lock poisoned").clone()
    }

    pub fn is_alive(&self, instance_id: &str) -> bool {
        instance_id == self.local.id || self.get_member(instance_id).is_some()
    }

    async fn join(&self) -> ClusterResult<()> {
        self.kv
            .put(
                &member_key(&self.local.id),
                encode_member_value(&self.local).into_bytes(),
                Some(self.lease_ttl),
            )
            .await
    }

    async fn process_events(&self, events: Vec<super::kv::WatchEvent>) {
        let mut registered = Vec::new();
        let mut unregistered_keys = Vec::new();
        {
            let mut members = self.members.write().expect("members lock poisoned");
            for ev in events {
                if ev.key == member_key(&self.local.id) {
                    continue; // ignore local instance events
                }
                match ev.kind {
                    WatchEventKind::Put { value, .. } => {
                        match decode_member(&ev.key, &String::from_utf8_lossy(&value)) {
                            Ok(m) => {
                                let fresh = members
                                    .insert(m.instance_id.clone(), m.clone())
                                    .is_none();
                                if fresh {
                                    tracing::info!(
                                        instance_id = %m.instance_id,
                                        address = %m.address(),
                                        cluster_api_ver = %m.api_version,
                                        "registered cluster member"
                                    );
                                }
                                registered.push(m);
                            }
                            Err(e) => {
                                tracing::warn!(key = %ev.key, error = %e, "failed to decode cluster member");
                            }
                        }
                    }
                    WatchEventKind::Del => {
                        let id = ev
                            .key
                            .strip_prefix(MEMBER_KEY_PREFIX)
                            .unwrap_or(&ev.key)
                            .to_owned();
                        members.remove(&id);
                        tracing::info!(instance_id = %id, "unregistered cluster member");
                        unregistered_keys.push(id);
                    }
                }
            }
        }
        self.run_hook(MemberListInfo {
            registered,
            unregistered_keys,
        })
        .await;
    }

    async fn run_hook(&self, info: MemberListInfo) {
        let mut ctx = ExecutionContext::new(HookInfo::MemberList(info));
        if let Err(e) = self.hooks.run(HookKind::MemberListUpdated, &mut ctx).await {
            tracing::warn!(error = %e, "failed to process memberlist changes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::kv::memory::MemoryKv;

    fn local(id: &str, port: u16) -> LocalInstance {
        LocalInstance::with_id(id, "127.0.0.1", port)
    }

    #[test]
    fn test_member_value_round_trip() {
        let lm = local("node-1", 5310);
        let value = encode_member_value(&lm);
        assert_eq!(value, "a=127.0.0.1:5310 cv=v1.0.0");

        let m = decode_member("i://node-1", &value).unwrap();
        assert_eq!(m.instance_id, "node-1");
        assert_eq!(m.host, "127.0.0.1");
        assert_eq!(m.port, 5310);
        assert_eq!(m.api_version, CLUSTER_API_VERSION);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_member("i://x", "nonsense").is_err());
        assert!(decode_member("wrong://x", "a=1:2 cv=v1.0.0").is_err());
        assert!(decode_member("i://x", "a=noport cv=v1.0.0").is_err());
    }

    #[test]
    fn test_api_version_parse() {
        let v: ApiVersion = "v2.10.3".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (2, 10, 3));
        assert!("2.10.3".parse::<ApiVersion>().is_err());
        assert!("v2.x".parse::<ApiVersion>().is_err());
    }

    #[tokio::test]
    async fn test_two_nodes_see_each_other() {
        let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
        let hooks = Arc::new(Hooks::new());

        let a = KvMemberList::new(
            kv.clone(),
            hooks.clone(),
            local("node-a", 1001),
            Duration::from_secs(40),
            Duration::from_secs(15),
        );
        let b = KvMemberList::new(
            kv.clone(),
            hooks.clone(),
            local("node-b", 1002),
            Duration::from_secs(40),
            Duration::from_secs(15),
        );
        a.start().await.unwrap();
        b.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.get_member("node-b").unwrap().port, 1002);
        assert_eq!(b.get_member("node-a").unwrap().port, 1001);
        // A node never lists itself.
        assert!(a.get_member("node-a").is_none());
        assert!(a.is_alive("node-a"));
    }

    #[tokio::test]
    async fn test_departure_removes_member() {
        let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
        let hooks = Arc::new(Hooks::new());

        let a = KvMemberList::new(
            kv.clone(),
            hooks.clone(),
            local("node-a", 1001),
            Duration::from_secs(40),
            Duration::from_secs(15),
        );
        let b = KvMemberList::new(
            kv.clone(),
            hooks.clone(),
            local("node-b", 1002),
            Duration::from_secs(40),
            Duration::from_secs(15),
        );
        a.start().await.unwrap();
        b.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        b.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(a.get_member("node-b").is_none());
        assert!(!a.is_alive("node-b"));
    }
}
