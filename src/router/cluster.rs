//! Forwarding to the instance that owns a remote resource.

use std::sync::Arc;

use crate::cluster::directory::ResourceDesc;
use crate::cluster::error::ClusterResult;
use crate::cluster::link::ClusterLinkManager;
use crate::xmpp::Stanza;

/// Thin dispatcher over the link manager.
pub struct ClusterRouter {
    links: Arc<ClusterLinkManager>,
}

impl ClusterRouter {
    pub fn new(links: Arc<ClusterLinkManager>) -> Arc<Self> {
        Arc::new(Self { links })
    }

    /// Hand a stanza to the instance named by the descriptor.
    ///
    /// `PeerUnavailable` and `UnknownResource` surface to the global
    /// router, which blacklists the descriptor briefly and re-resolves.
    pub async fn forward(&self, stanza: &Stanza, desc: &ResourceDesc) -> ClusterResult<()> {
        tracing::debug!(
            target = %desc.jid,
            instance_id = %desc.instance_id,
            "forwarding stanza to peer"
        );
        self.links
            .route_stanza(&desc.instance_id, &desc.jid, stanza.element())
            .await
    }
}
