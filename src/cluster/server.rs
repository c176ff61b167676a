//! Cluster RPC listener.
//!
//! Each instance serves the peer RPC surface against its own local
//! router and queue map: stanza delivery, presence fan-out, queue
//! transfer and remote stream disconnect.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::router::local::LocalRouter;
use crate::sm::queue::QueueMap;
use crate::xmpp::{Stanza, StreamErrorCondition};

use super::error::ClusterResult;
use super::rpc::{RpcRequest, RpcResponse, read_frame, write_frame};

/// Serves peer RPCs for this instance.
pub struct ClusterServer {
    listener: TcpListener,
    local_router: Arc<LocalRouter>,
    queues: Arc<QueueMap>,
    cancel: CancellationToken,
}

impl ClusterServer {
    pub async fn bind(
        addr: &str,
        local_router: Arc<LocalRouter>,
        queues: Arc<QueueMap>,
    ) -> ClusterResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "cluster server listening");
        Ok(Self {
            listener,
            local_router,
            queues,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> ClusterResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accept peer connections until shutdown.
    pub async fn run(&self) -> ClusterResult<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("cluster server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (conn, peer_addr) = accepted?;
                    tracing::debug!(peer_addr = %peer_addr, "accepted peer connection");
                    let local_router = self.local_router.clone();
                    let queues = self.queues.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            res = serve_peer(conn, local_router, queues) => {
                                if let Err(e) = res {
                                    tracing::warn!(peer_addr = %peer_addr, error = %e, "peer connection failed");
                                }
                            }
                        }
                    });
                }
            }
        }
    }
}

async fn serve_peer(
    mut conn: TcpStream,
    local_router: Arc<LocalRouter>,
    queues: Arc<QueueMap>,
) -> ClusterResult<()> {
    while let Some(req) = read_frame::<_, RpcRequest>(&mut conn).await? {
        let resp = dispatch(req, &local_router, &queues).await;
        write_frame(&mut conn, &resp).await?;
    }
    Ok(())
}

async fn dispatch(
    req: RpcRequest,
    local_router: &Arc<LocalRouter>,
    queues: &Arc<QueueMap>,
) -> RpcResponse {
    match req {
        RpcRequest::RouteStanza { target, stanza } => {
            let mut stanza = stanza;
            stanza.set_attribute(crate::xmpp::ATTR_TO, target.to_string());
            let stanza = match Stanza::try_from(stanza) {
                Ok(s) => s,
                Err(e) => return RpcResponse::Error(e.to_string()),
            };
            match local_router.deliver(stanza).await {
                Ok(()) => RpcResponse::Ok,
                Err(_) => RpcResponse::UnknownResource,
            }
        }

        RpcRequest::BroadcastPresence { from, presence } => {
            for stream in local_router.streams() {
                let mut el = presence.clone();
                el.set_attribute(crate::xmpp::ATTR_FROM, from.to_string());
                if let Err(e) = stream.send_element(el).await {
                    tracing::debug!(stream_id = stream.id(), error = %e, "presence fan-out send failed");
                }
            }
            RpcResponse::Ok
        }

        RpcRequest::TransferQueue { queue_key } => {
            // Detach-then-reply guarantees at most one owner: the loser
            // of two concurrent transfers observes NotFound.
            match queues.detach(&queue_key) {
                Some(queue) => {
                    queue.cancel_timers();
                    tracing::info!(queue = %queue_key, "transferred stream queue to peer");
                    RpcResponse::Queue(queue.snapshot())
                }
                None => RpcResponse::NotFound,
            }
        }

        RpcRequest::DisconnectStream { jid, condition } => {
            let (Some(user), Some(resource)) = (jid.node(), jid.resource()) else {
                return RpcResponse::UnknownResource;
            };
            match local_router.get(user, resource) {
                Some(stream) => {
                    let condition = StreamErrorCondition::from_name(&condition)
                        .unwrap_or(StreamErrorCondition::Conflict);
                    stream.disconnect(condition).await;
                    RpcResponse::Ok
                }
                None => RpcResponse::UnknownResource,
            }
        }
    }
}
