//! Node assembly.
//!
//! Wires one instance's components together: KV-backed member and
//! resource directories, the queue map, routers, stream management and
//! the cluster RPC server. There are no hidden singletons — every
//! shared structure is built here and handed to its consumers
//! explicitly.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::cluster::kv::KV;
use crate::cluster::{
    ClusterLinkManager, ClusterServer, KvMemberList, KvResourceDirectory, LocalInstance,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hook::Hooks;
use crate::router::{ClusterRouter, GlobalRouter, LocalRouter, S2sOutProvider};
use crate::server::SessionDeps;
use crate::server::sasl::Authenticator;
use crate::sm::StreamManager;
use crate::sm::queue::QueueMap;

/// One running chorus instance (cluster plane only; C2S listeners are
/// bound separately with [`crate::server::C2sServer::bind`]).
pub struct Node {
    config: Config,
    local: LocalInstance,
    hooks: Arc<Hooks>,
    members: Arc<KvMemberList>,
    directory: Arc<KvResourceDirectory>,
    local_router: Arc<LocalRouter>,
    queues: Arc<QueueMap>,
    router: Arc<GlobalRouter>,
    sm: Arc<StreamManager>,
    authenticator: Arc<dyn Authenticator>,
    cluster_task: JoinHandle<()>,
    cluster_server: Arc<ClusterServer>,
}

impl Node {
    /// Join the cluster and start every background task.
    ///
    /// Failure to register in the member directory or to bind the
    /// cluster listener is fatal for startup.
    pub async fn start(
        config: Config,
        kv: Arc<dyn KV>,
        authenticator: Arc<dyn Authenticator>,
        s2s: Option<Arc<S2sOutProvider>>,
    ) -> Result<Node> {
        Self::start_with_instance_id(config, kv, authenticator, s2s, None).await
    }

    /// As [`Node::start`], with an explicit instance id (orchestrators
    /// often assign stable names).
    pub async fn start_with_instance_id(
        config: Config,
        kv: Arc<dyn KV>,
        authenticator: Arc<dyn Authenticator>,
        s2s: Option<Arc<S2sOutProvider>>,
        instance_id: Option<String>,
    ) -> Result<Node> {
        let hooks = Arc::new(Hooks::new());
        let local_router = LocalRouter::new();
        let queues = QueueMap::new();
        local_router.set_queue_map(queues.clone());

        // Bind the RPC listener first so the advertised member record
        // carries the real port (ephemeral binds included).
        let cluster_server = Arc::new(
            ClusterServer::bind(
                &config.cluster.bind_addr,
                local_router.clone(),
                queues.clone(),
            )
            .await?,
        );
        let bound = cluster_server.local_addr()?;
        let host = config
            .cluster
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_owned())
            .filter(|h| h != "0.0.0.0" && !h.is_empty())
            .unwrap_or_else(|| "127.0.0.1".to_owned());
        let local = match instance_id {
            Some(id) => LocalInstance::with_id(id, host, bound.port()),
            None => LocalInstance::new(host, bound.port()),
        };

        let members = KvMemberList::new(
            kv.clone(),
            hooks.clone(),
            local.clone(),
            config.cluster.lease_ttl(),
            config.cluster.heartbeat_interval(),
        );
        members.start().await?;

        let directory = KvResourceDirectory::new(
            kv,
            hooks.clone(),
            members.clone(),
            config.cluster.lease_ttl(),
            config.cluster.heartbeat_interval(),
        );
        directory.start().await?;

        let links = ClusterLinkManager::new(members.clone(), config.cluster.clone());
        links.start(&hooks);

        let router = GlobalRouter::new(
            config.hosts.clone(),
            local.id.clone(),
            hooks.clone(),
            directory.clone(),
            local_router.clone(),
            ClusterRouter::new(links.clone()),
            s2s,
        );

        let sm = StreamManager::new(
            config.sm.clone(),
            hooks.clone(),
            queues.clone(),
            local_router.clone(),
            directory.clone(),
            links,
            local.id.clone(),
        );
        sm.start();

        let server = cluster_server.clone();
        let cluster_task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "cluster server terminated");
            }
        });

        tracing::info!(instance_id = %local.id, "node started");
        Ok(Node {
            config,
            local,
            hooks,
            members,
            directory,
            local_router,
            queues,
            router,
            sm,
            authenticator,
            cluster_task,
            cluster_server,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.local.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn members(&self) -> &Arc<KvMemberList> {
        &self.members
    }

    pub fn directory(&self) -> &Arc<KvResourceDirectory> {
        &self.directory
    }

    pub fn local_router(&self) -> &Arc<LocalRouter> {
        &self.local_router
    }

    pub fn queues(&self) -> &Arc<QueueMap> {
        &self.queues
    }

    pub fn router(&self) -> &Arc<GlobalRouter> {
        &self.router
    }

    pub fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.sm
    }

    /// The dependency bundle a C2S listener or session needs.
    pub fn session_deps(&self) -> Arc<SessionDeps> {
        Arc::new(SessionDeps {
            hooks: self.hooks.clone(),
            router: self.router.clone(),
            directory: self.directory.clone(),
            queues: self.queues.clone(),
            authenticator: self.authenticator.clone(),
            local_instance_id: self.local.id.clone(),
        })
    }

    /// Leave the cluster and stop background tasks.
    pub async fn shutdown(&self) -> Result<()> {
        self.cluster_server.shutdown();
        self.cluster_task.abort();
        self.directory.stop();
        self.members.stop().await.map_err(Error::from)?;
        tracing::info!(instance_id = %self.local.id, "node stopped");
        Ok(())
    }
}
