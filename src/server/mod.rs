//! C2S listener.
//!
//! Accepts client TCP connections, applies the connection-level
//! protections (per-IP and global caps, auth-failure lockouts), wraps
//! each socket in a transport with the embedder's element parser, and
//! drives a [`C2sSession`] per connection. Supports graceful shutdown
//! with drain-and-wait.

pub mod rate_limiter;
pub mod sasl;
pub mod session;
pub mod transport;

#[cfg(feature = "tls")]
pub mod tls;

pub use rate_limiter::{AuthRateLimiter, AuthRateLimiterConfig};
pub use session::{C2sSession, C2sSessionHandle, SessionDeps, SessionState};
pub use transport::{MemoryTransport, MemoryTransportHandle, SocketTransport, Transport};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast};

use crate::config::C2sConfig;
use crate::error::{Error, Result};
use crate::xmpp::ElementParser;

#[cfg(feature = "tls")]
use self::tls::TlsConfig;

/// Produces one parser per accepted connection.
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn ElementParser> + Send + Sync>;

/// XMPP C2S TCP server with graceful shutdown support.
pub struct C2sServer {
    listener: TcpListener,
    cfg: C2sConfig,
    deps: Arc<SessionDeps>,
    parser_factory: ParserFactory,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
    connections_per_ip: Arc<RwLock<HashMap<IpAddr, usize>>>,
    auth_rate_limiter: Arc<AuthRateLimiter>,
    #[cfg(feature = "tls")]
    tls: Option<TlsConfig>,
}

impl C2sServer {
    pub async fn bind(
        cfg: C2sConfig,
        deps: Arc<SessionDeps>,
        parser_factory: ParserFactory,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.bind_addr)
            .await
            .map_err(|e| Error::Io(e.kind()))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(
            addr = %cfg.bind_addr,
            max_per_ip = cfg.max_connections_per_ip,
            max_total = cfg.max_total_connections,
            "c2s server listening"
        );

        Ok(Self {
            listener,
            cfg,
            deps,
            parser_factory,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            connections_per_ip: Arc::new(RwLock::new(HashMap::new())),
            auth_rate_limiter: Arc::new(AuthRateLimiter::new()),
            #[cfg(feature = "tls")]
            tls: None,
        })
    }

    /// Attach a TLS identity: offered via STARTTLS, or required before
    /// the stream header when the listener is direct-TLS.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| Error::Io(e.kind()))
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn auth_rate_limiter(&self) -> Arc<AuthRateLimiter> {
        self.auth_rate_limiter.clone()
    }

    /// Stop accepting connections. Existing sessions run on.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        tracing::info!("shutdown signal sent");
    }

    /// Stop accepting and wait for sessions to drain.
    ///
    /// Returns `true` if all connections drained within the timeout.
    pub async fn shutdown_and_wait(&self, timeout: std::time::Duration) -> bool {
        self.shutdown();

        let start = std::time::Instant::now();
        let check_interval = std::time::Duration::from_millis(100);
        while start.elapsed() < timeout {
            let active = self.active_connections.load(Ordering::SeqCst);
            if active == 0 {
                tracing::info!("all connections drained");
                return true;
            }
            tracing::debug!(active_connections = active, "waiting for connections to drain");
            tokio::time::sleep(check_interval).await;
        }

        let remaining = self.active_connections.load(Ordering::SeqCst);
        tracing::warn!(
            remaining_connections = remaining,
            "shutdown timeout, connections still active"
        );
        false
    }

    /// Accept and serve connections until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (conn, addr) = accepted.map_err(|e| Error::Io(e.kind()))?;
                    let ip = addr.ip();

                    if let Some(remaining) = self.auth_rate_limiter.check_rate_limit(ip).await {
                        tracing::warn!(
                            client_ip = %ip,
                            remaining_secs = remaining.as_secs(),
                            "rejecting connection, IP locked out after auth failures"
                        );
                        drop(conn);
                        continue;
                    }

                    if self.cfg.max_total_connections > 0 {
                        let current = self.active_connections.load(Ordering::SeqCst);
                        if current >= self.cfg.max_total_connections {
                            tracing::warn!(
                                client_ip = %ip,
                                current_connections = current,
                                max_connections = self.cfg.max_total_connections,
                                "rejecting connection, global limit exceeded"
                            );
                            drop(conn);
                            continue;
                        }
                    }

                    let current_for_ip = {
                        let counts = self.connections_per_ip.read().await;
                        *counts.get(&ip).unwrap_or(&0)
                    };
                    if current_for_ip >= self.cfg.max_connections_per_ip {
                        tracing::warn!(
                            client_ip = %ip,
                            current_connections = current_for_ip,
                            max_connections = self.cfg.max_connections_per_ip,
                            "rejecting connection, per-IP limit exceeded"
                        );
                        drop(conn);
                        continue;
                    }

                    {
                        let mut counts = self.connections_per_ip.write().await;
                        *counts.entry(ip).or_insert(0) += 1;
                    }
                    self.active_connections.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(client_addr = %addr, "accepted connection");

                    let cfg = self.cfg.clone();
                    let deps = self.deps.clone();
                    let parser = (self.parser_factory)();
                    let limiter = self.auth_rate_limiter.clone();
                    let active_connections = self.active_connections.clone();
                    let connections_per_ip = self.connections_per_ip.clone();
                    #[cfg(feature = "tls")]
                    let tls = self.tls.clone();

                    tokio::spawn(async move {
                        #[cfg(feature = "tls")]
                        let transport: Option<Box<dyn Transport>> = if cfg.direct_tls {
                            match &tls {
                                Some(tls_cfg) => {
                                    match tls_cfg.acceptor().accept(conn).await {
                                        Ok(secured) => Some(Box::new(SocketTransport::new_tls(
                                            secured,
                                            parser,
                                            &cfg.read_rate,
                                        ))),
                                        Err(e) => {
                                            tracing::warn!(client_addr = %addr, error = %e, "tls handshake failed");
                                            None
                                        }
                                    }
                                }
                                None => {
                                    tracing::error!("direct-tls listener without a TLS identity");
                                    None
                                }
                            }
                        } else {
                            Some(Box::new(SocketTransport::new(conn, parser, &cfg.read_rate)))
                        };

                        #[cfg(not(feature = "tls"))]
                        let transport: Option<Box<dyn Transport>> =
                            Some(Box::new(SocketTransport::new(conn, parser, &cfg.read_rate)));

                        if let Some(transport) = transport {
                            let direct_tls = cfg.direct_tls;
                            let session = C2sSession::new(transport, cfg, deps)
                                .with_rate_limiter(limiter, ip);
                            #[cfg(feature = "tls")]
                            let session = match tls {
                                Some(tls_cfg) => session.with_tls(tls_cfg, direct_tls),
                                None => session,
                            };
                            #[cfg(not(feature = "tls"))]
                            let _ = direct_tls;
                            session.run().await;
                        }

                        active_connections.fetch_sub(1, Ordering::SeqCst);
                        let mut counts = connections_per_ip.write().await;
                        if let Some(count) = counts.get_mut(&ip) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                counts.remove(&ip);
                            }
                        }
                    });
                }
            }
        }
    }
}
