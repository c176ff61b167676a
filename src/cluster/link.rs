//! Peer links.
//!
//! The link manager owns one logical connection per peer instance,
//! dialed lazily on first use with single-flight per peer, and dropped
//! when the member directory reports the peer gone or a call fails.
//! Every failure surfaces as `PeerUnavailable`; callers decide whether
//! the operation is retryable (`TransferQueue` is not — see the resume
//! flow).

use std::sync::{Arc, Weak};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::ClusterConfig;
use crate::hook::{
    ExecutionContext, FnHandler, HookInfo, HookKind, HookOutcome, Hooks, PRIORITY_DEFAULT,
};
use crate::jid::Jid;
use crate::xmpp::{Element, StreamErrorCondition};

use super::error::{ClusterError, ClusterResult};
use super::member::KvMemberList;
use super::rpc::{QueueSnapshot, RpcRequest, RpcResponse, read_frame, write_frame};

/// Backoff for the initial dial to a peer.
fn dial_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(3)
        .with_jitter()
}

/// One open connection to a peer. Calls are serialized per link; the
/// connection carries strictly request/response traffic.
pub struct ClusterLink {
    instance_id: String,
    conn: Mutex<TcpStream>,
}

impl ClusterLink {
    async fn call(&self, req: &RpcRequest, deadline: Duration) -> ClusterResult<RpcResponse> {
        let mut conn = self.conn.lock().await;
        let exchange = async {
            write_frame(&mut *conn, req).await?;
            read_frame::<_, RpcResponse>(&mut *conn).await
        };
        match tokio::time::timeout(deadline, exchange).await {
            Err(_) => Err(ClusterError::DeadlineExceeded),
            Ok(Err(e)) => Err(e),
            Ok(Ok(None)) => Err(ClusterError::PeerUnavailable {
                instance_id: self.instance_id.clone(),
            }),
            Ok(Ok(Some(resp))) => Ok(resp),
        }
    }
}

type LinkSlot = Arc<Mutex<Option<Arc<ClusterLink>>>>;

/// Dial-on-demand manager of peer links.
pub struct ClusterLinkManager {
    members: Arc<KvMemberList>,
    cfg: ClusterConfig,
    // One entry (and one dial-serializing lock) per peer.
    slots: DashMap<String, LinkSlot>,
}

impl ClusterLinkManager {
    pub fn new(members: Arc<KvMemberList>, cfg: ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            members,
            cfg,
            slots: DashMap::new(),
        })
    }

    /// Register the peer-gone listener: links of departed members are
    /// closed eagerly instead of waiting for the next failed call.
    pub fn start(self: &Arc<Self>, hooks: &Hooks) {
        let weak: Weak<ClusterLinkManager> = Arc::downgrade(self);
        hooks.add(
            HookKind::MemberListUpdated,
            PRIORITY_DEFAULT,
            Arc::new(FnHandler(move |ctx: &mut ExecutionContext| {
                let weak = weak.clone();
                let gone: Vec<String> = match &ctx.info {
                    HookInfo::MemberList(info) => info.unregistered_keys.clone(),
                    _ => Vec::new(),
                };
                async move {
                    if let Some(manager) = weak.upgrade() {
                        for instance_id in gone {
                            manager.drop_link(&instance_id);
                        }
                    }
                    Ok(HookOutcome::Continue)
                }
            })),
        );
    }

    /// Best-effort stanza delivery on the peer's local router.
    pub async fn route_stanza(
        &self,
        instance_id: &str,
        target: &Jid,
        stanza: &Element,
    ) -> ClusterResult<()> {
        let req = RpcRequest::RouteStanza {
            target: target.clone(),
            stanza: stanza.clone(),
        };
        match self.call(instance_id, &req).await? {
            RpcResponse::Ok => Ok(()),
            RpcResponse::UnknownResource => Err(ClusterError::UnknownResource),
            other => Err(ClusterError::Decode(format!(
                "unexpected route response: {other:?}"
            ))),
        }
    }

    /// Presence fan-out to the peer's locally-bound streams.
    pub async fn broadcast_presence(
        &self,
        instance_id: &str,
        from: &Jid,
        presence: &Element,
    ) -> ClusterResult<()> {
        let req = RpcRequest::BroadcastPresence {
            from: from.clone(),
            presence: presence.clone(),
        };
        self.call(instance_id, &req).await.map(|_| ())
    }

    /// Atomically move a hibernated queue off the peer.
    ///
    /// Idempotence note: the peer detaches before replying, so a second
    /// call (or a concurrent one) observes `NotFound`. Callers must not
    /// retry blindly — a lost response means the queue may be gone.
    pub async fn transfer_queue(
        &self,
        instance_id: &str,
        queue_key: &str,
    ) -> ClusterResult<QueueSnapshot> {
        let req = RpcRequest::TransferQueue {
            queue_key: queue_key.to_owned(),
        };
        match self.call(instance_id, &req).await? {
            RpcResponse::Queue(snapshot) => Ok(snapshot),
            RpcResponse::NotFound => Err(ClusterError::NotFound),
            other => Err(ClusterError::Decode(format!(
                "unexpected transfer response: {other:?}"
            ))),
        }
    }

    /// Best-effort close of the peer's stream for a full JID.
    pub async fn disconnect_stream(
        &self,
        instance_id: &str,
        jid: &Jid,
        condition: StreamErrorCondition,
    ) -> ClusterResult<()> {
        let req = RpcRequest::DisconnectStream {
            jid: jid.clone(),
            condition: condition.name().to_owned(),
        };
        self.call(instance_id, &req).await.map(|_| ())
    }

    async fn call(&self, instance_id: &str, req: &RpcRequest) -> ClusterResult<RpcResponse> {
        let link = self.link(instance_id).await?;
        match link.call(req, self.cfg.req_timeout()).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                // A broken link is dropped; the next call re-dials.
                self.drop_link(instance_id);
                tracing::warn!(instance_id = %instance_id, error = %e, "cluster link call failed");
                Err(match e {
                    ClusterError::DeadlineExceeded => ClusterError::DeadlineExceeded,
                    _ => ClusterError::PeerUnavailable {
                        instance_id: instance_id.to_owned(),
                    },
                })
            }
        }
    }

    async fn link(&self, instance_id: &str) -> ClusterResult<Arc<ClusterLink>> {
        let slot = self
            .slots
            .entry(instance_id.to_owned())
            .or_default()
            .clone();

        // Per-peer slot lock makes the dial single-flight.
        let mut guard = slot.lock().await;
        if let Some(link) = guard.as_ref() {
            return Ok(link.clone());
        }

        let member =
            self.members
                .get_member(instance_id)
                .ok_or_else(|| ClusterError::UnknownMember(instance_id.to_owned()))?;
        let addr = member.address();
        let dial_timeout = self.cfg.dial_timeout();

        let conn = (|| async {
            tokio::time::timeout(dial_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| ClusterError::DeadlineExceeded)?
                .map_err(ClusterError::from)
        })
        .retry(dial_policy())
        .await
        .map_err(|e| {
            tracing::warn!(instance_id = %instance_id, address = %addr, error = %e, "failed to dial peer");
            ClusterError::PeerUnavailable {
                instance_id: instance_id.to_owned(),
            }
        })?;

        tracing::info!(instance_id = %instance_id, address = %addr, "opened cluster link");
        let link = Arc::new(ClusterLink {
            instance_id: instance_id.to_owned(),
            conn: Mutex::new(conn),
        });
        *guard = Some(link.clone());
        Ok(link)
    }

    fn drop_link(&self, instance_id: &str) {
        if self.slots.remove(instance_id).is_some() {
            tracing::info!(instance_id = %instance_id, "closed cluster link");
        }
    }
}
