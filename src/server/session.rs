//! C2S stream state machine.
//!
//! One [`C2sSession`] drives a client connection through negotiation,
//! binding and stanza exchange:
//!
//! ```text
//! Connecting → Connected → Authenticating → Authenticated → Binding → Bound
//!                                                                      │
//!                                              Hibernated ←────────────┤
//!                                                   │                  │
//!                                                   └──→ Disconnected ←┘
//! ```
//!
//! `Hibernated` is reachable only from `Bound` with stream management
//! enabled, when the transport drops: the session object is retained in
//! the router table, deliveries divert into its queue, and a later
//! resume adopts the identity on a fresh session.
//!
//! The session is one task: it selects over the transport read path,
//! the send channel and the control channel. Hooks and routing run
//! inline, so per-stream processing is serialized; the send channel is
//! unbounded and drains between events.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cluster::directory::{KvResourceDirectory, ResourceDesc};
use crate::config::C2sConfig;
use crate::constants::SM_NAMESPACE;
use crate::error::{Error, Result};
use crate::hook::{C2SStreamInfo, ExecutionContext, HookInfo, HookKind, Hooks};
use crate::info::{INFO_SM_ENABLED, InfoMap};
use crate::jid::Jid;
use crate::router::GlobalRouter;
use crate::router::stream::C2sStream;
use crate::sm::queue::QueueMap;
use crate::sm::queue_key;
use crate::xmpp::{
    ATTR_FROM, ATTR_ID, ATTR_TO, ATTR_TYPE, Element, Stanza, StanzaErrorCondition, StanzaKind,
    StreamErrorCondition, StreamEvent, error_reply, presence_is_available, stream_error,
};

use super::rate_limiter::AuthRateLimiter;
use super::sasl::{AuthSession, Authenticator, SASL_NAMESPACE, SaslMechanism, SaslOutcome, advertised};
use super::transport::Transport;

#[cfg(feature = "tls")]
use super::tls::TlsConfig;

const BIND_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const TLS_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-tls";
const STREAMS_NAMESPACE: &str = "http://etherx.jabber.org/streams";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Binding,
    Bound,
    Hibernated,
    Disconnected,
}

/// Shared collaborators handed to every session.
pub struct SessionDeps {
    pub hooks: Arc<Hooks>,
    pub router: Arc<GlobalRouter>,
    pub directory: Arc<KvResourceDirectory>,
    pub queues: Arc<QueueMap>,
    pub authenticator: Arc<dyn Authenticator>,
    pub local_instance_id: String,
}

struct OutItem {
    element: Element,
    tracked: bool,
}

enum SessionCtl {
    Disconnect(StreamErrorCondition),
}

/// The shareable face of a session: registered in the router table,
/// passed to hooks, swapped into queues on resume.
pub struct C2sSessionHandle {
    id: u64,
    state: Mutex<SessionState>,
    jid: RwLock<Option<Jid>>,
    info: RwLock<InfoMap>,
    out_tx: mpsc::UnboundedSender<OutItem>,
    ctl_tx: mpsc::UnboundedSender<SessionCtl>,
    deps: Arc<SessionDeps>,
    self_ref: Weak<C2sSessionHandle>,
}

impl C2sSessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state lock poisoned") = state;
    }

    fn as_dyn(&self) -> Arc<dyn C2sStream> {
        self.self_ref.upgrade().expect("session handle self ref")
    }

    fn sm_enabled(&self) -> bool {
        self.info().bool_value(INFO_SM_ENABLED)
    }

    /// Remove every trace of this stream: router entry, owned resource
    /// record, queue. Idempotent.
    async fn cleanup(&self) {
        {
            let mut state = self.state.lock().expect("session state lock poisoned");
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnected;
        }

        let jid = self.jid();
        if let Some(jid) = &jid {
            let (user, resource) = (
                jid.node().unwrap_or_default().to_owned(),
                jid.resource().unwrap_or_default().to_owned(),
            );
            let this = self.as_dyn();
            self.deps.router.local_router().unregister(&this);

            // A conflicting re-bind may already own this key; its
            // record and queue are not ours to tear down.
            let rebound = self
                .deps
                .router
                .local_router()
                .get(&user, &resource)
                .is_some_and(|s| s.id() != self.id);
            if !rebound {
                if let Some(queue) = self.deps.queues.detach(&queue_key(jid)) {
                    queue.cancel_timers();
                }
                if let Err(e) = self.deps.directory.del_if_owner(&user, &resource).await {
                    tracing::warn!(jid = %jid, error = %e, "failed to remove resource record");
                }
            }
        }

        let mut ctx = ExecutionContext::with_stream(
            HookInfo::C2SStream(C2SStreamInfo {
                id: self.id,
                jid,
                element: None,
            }),
            self.as_dyn(),
        );
        if let Err(e) = self
            .deps
            .hooks
            .run(HookKind::C2SStreamDisconnected, &mut ctx)
            .await
        {
            tracing::warn!(error = %e, "stream disconnected hook failed");
        }
    }
}

#[async_trait]
impl C2sStream for C2sSessionHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn jid(&self) -> Option<Jid> {
        self.jid.read().expect("session jid lock poisoned").clone()
    }

    fn info(&self) -> InfoMap {
        self.info.read().expect("session info lock poisoned").clone()
    }

    async fn set_info_value(&self, key: &str, value: &str) {
        self.info
            .write()
            .expect("session info lock poisoned")
            .set(key, value);
    }

    fn is_bound(&self) -> bool {
        self.state() == SessionState::Bound
    }

    fn is_hibernated(&self) -> bool {
        self.state() == SessionState::Hibernated
    }

    async fn send_element(&self, element: Element) -> Result<()> {
        if self.state() == SessionState::Disconnected {
            return Err(Error::Closed);
        }
        self.out_tx
            .send(OutItem {
                element,
                tracked: true,
            })
            .map_err(|_| Error::Closed)
    }

    async fn send_element_untracked(&self, element: Element) -> Result<()> {
        if self.state() == SessionState::Disconnected {
            return Err(Error::Closed);
        }
        self.out_tx
            .send(OutItem {
                element,
                tracked: false,
            })
            .map_err(|_| Error::Closed)
    }

    async fn disconnect(&self, condition: StreamErrorCondition) {
        match self.state() {
            SessionState::Disconnected => {}
            // No transport to write the error to; straight to cleanup.
            SessionState::Hibernated => self.cleanup().await,
            _ => {
                if self.ctl_tx.send(SessionCtl::Disconnect(condition)).is_err() {
                    self.cleanup().await;
                }
            }
        }
    }

    async fn resume(&self, jid: Jid, presence: Option<Element>, info: InfoMap) -> Result<()> {
        *self.jid.write().expect("session jid lock poisoned") = Some(jid.clone());
        *self.info.write().expect("session info lock poisoned") = info.clone();
        self.set_state(SessionState::Bound);

        self.deps.router.local_router().register(self.as_dyn());
        self.deps
            .directory
            .put(ResourceDesc {
                instance_id: self.deps.local_instance_id.clone(),
                jid,
                presence,
                info,
            })
            .await?;
        Ok(())
    }
}

/// How the session loop ended.
enum LoopEnd {
    /// Orderly close; optionally with a stream error to emit first.
    Close(Option<StreamErrorCondition>),
    /// The transport died under us.
    TransportLost,
}

enum Flow {
    Continue,
    Close(Option<StreamErrorCondition>),
}

/// One client connection.
pub struct C2sSession {
    handle: Arc<C2sSessionHandle>,
    transport: Box<dyn Transport>,
    deps: Arc<SessionDeps>,
    cfg: C2sConfig,
    out_rx: mpsc::UnboundedReceiver<OutItem>,
    ctl_rx: mpsc::UnboundedReceiver<SessionCtl>,
    domain: String,
    auth_username: Option<String>,
    auth_session: Option<Box<dyn AuthSession>>,
    auth_limiter: Option<Arc<AuthRateLimiter>>,
    peer_ip: Option<IpAddr>,
    #[cfg(feature = "tls")]
    tls: Option<TlsConfig>,
    secured: bool,
}

impl C2sSession {
    pub fn new(transport: Box<dyn Transport>, cfg: C2sConfig, deps: Arc<SessionDeps>) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();

        let handle = Arc::new_cyclic(|self_ref| C2sSessionHandle {
            id,
            state: Mutex::new(SessionState::Connecting),
            jid: RwLock::new(None),
            info: RwLock::new(InfoMap::new()),
            out_tx,
            ctl_tx,
            deps: deps.clone(),
            self_ref: self_ref.clone(),
        });

        let domain = deps
            .router
            .hosts()
            .first()
            .cloned()
            .unwrap_or_else(|| "localhost".to_owned());

        Self {
            handle,
            transport,
            deps,
            cfg,
            out_rx,
            ctl_rx,
            domain,
            auth_username: None,
            auth_session: None,
            auth_limiter: None,
            peer_ip: None,
            #[cfg(feature = "tls")]
            tls: None,
            secured: false,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<AuthRateLimiter>, peer_ip: IpAddr) -> Self {
        self.auth_limiter = Some(limiter);
        self.peer_ip = Some(peer_ip);
        self
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsConfig, already_secured: bool) -> Self {
        self.tls = Some(tls);
        self.secured = already_secured;
        self
    }

    pub fn handle(&self) -> Arc<C2sSessionHandle> {
        self.handle.clone()
    }

    /// Drive the connection to completion.
    pub async fn run(mut self) {
        let end = self.run_loop().await;
        match end {
            LoopEnd::Close(condition) => {
                if let Some(condition) = condition {
                    let _ = self.transport.write_element(&stream_error(condition)).await;
                }
                let _ = self.transport.write_raw("</stream:stream>").await;
                let _ = self.transport.close().await;
                self.handle.cleanup().await;
            }
            LoopEnd::TransportLost => {
                let _ = self.transport.close().await;
                if self.handle.state() == SessionState::Bound && self.handle.sm_enabled() {
                    self.hibernate().await;
                } else {
                    self.handle.cleanup().await;
                }
            }
        }
    }

    async fn run_loop(&mut self) -> LoopEnd {
        loop {
            let state = self.handle.state();
            if state == SessionState::Disconnected {
                return LoopEnd::Close(None);
            }
            let read_timeout = if state == SessionState::Bound {
                self.cfg.keep_alive_timeout()
            } else {
                self.cfg.connect_timeout()
            };

            tokio::select! {
                biased;

                Some(ctl) = self.ctl_rx.recv() => {
                    let SessionCtl::Disconnect(condition) = ctl;
                    return LoopEnd::Close(Some(condition));
                }

                Some(item) = self.out_rx.recv() => {
                    if self.write_out(item).await.is_err() {
                        return LoopEnd::TransportLost;
                    }
                }

                event = tokio::time::timeout(read_timeout, self.transport.next_event()) => {
                    match event {
                        Err(_) => {
                            // Silent too long. An SM-enabled bound stream
                            // hibernates; everything else times out.
                            if state == SessionState::Bound && self.handle.sm_enabled() {
                                return LoopEnd::TransportLost;
                            }
                            return LoopEnd::Close(Some(StreamErrorCondition::ConnectionTimeout));
                        }
                        Ok(Ok(Some(ev))) => match self.handle_event(ev).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close(condition)) => return LoopEnd::Close(condition),
                            Err(e) => {
                                tracing::debug!(stream_id = self.handle.id, error = %e, "transport failure");
                                return LoopEnd::TransportLost;
                            }
                        },
                        Ok(Ok(None)) => return LoopEnd::TransportLost,
                        Ok(Err(e)) => {
                            tracing::debug!(stream_id = self.handle.id, error = %e, "transport read failed");
                            return LoopEnd::TransportLost;
                        }
                    }
                }
            }
        }
    }

    async fn write_out(&mut self, item: OutItem) -> Result<()> {
        self.transport.write_element(&item.element).await?;
        self.transport.flush().await?;
        if item.tracked {
            self.run_stream_hook(HookKind::C2SStreamElementSent, Some(item.element))
                .await;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Result<Flow> {
        match event {
            StreamEvent::StreamOpen { attrs } => self.handle_stream_open(attrs).await,
            StreamEvent::StreamClosed => Ok(Flow::Close(None)),
            StreamEvent::Element(el) => {
                if el.serialized_len() > self.cfg.max_stanza_size {
                    tracing::info!(
                        stream_id = self.handle.id,
                        size = el.serialized_len(),
                        "inbound stanza exceeds size limit"
                    );
                    return Ok(Flow::Close(Some(StreamErrorCondition::PolicyViolation)));
                }
                match self.handle.state() {
                    SessionState::Connecting => {
                        Ok(Flow::Close(Some(StreamErrorCondition::InvalidXml)))
                    }
                    SessionState::Connected => self.handle_pre_auth(el).await,
                    SessionState::Authenticating => self.handle_auth_response(el).await,
                    SessionState::Authenticated | SessionState::Binding => {
                        self.handle_pre_bind(el).await
                    }
                    SessionState::Bound => self.handle_bound(el).await,
                    SessionState::Hibernated | SessionState::Disconnected => Ok(Flow::Continue),
                }
            }
        }
    }

    async fn handle_stream_open(
        &mut self,
        attrs: std::collections::BTreeMap<String, String>,
    ) -> Result<Flow> {
        if let Some(to) = attrs.get("to") {
            if !self.deps.router.is_local_host(to) {
                tracing::info!(stream_id = self.handle.id, host = %to, "stream to unserved host");
                return Ok(Flow::Close(Some(StreamErrorCondition::HostUnknown)));
            }
            self.domain = to.clone();
        }

        let first_open = self.handle.state() == SessionState::Connecting;
        if first_open {
            self.handle.set_state(SessionState::Connected);
            self.run_stream_hook(HookKind::C2SStreamConnected, None).await;
        }

        let header = format!(
            "<?xml version='1.0'?><stream:stream from='{}' id='{}' \
             xmlns='jabber:client' xmlns:stream='{}' version='1.0'>",
            self.domain,
            Uuid::new_v4(),
            STREAMS_NAMESPACE,
        );
        self.transport.write_raw(&header).await?;
        self.transport.write_element(&self.stream_features()).await?;
        self.transport.flush().await?;
        Ok(Flow::Continue)
    }

    fn stream_features(&self) -> Element {
        let mut features = Element::builder("stream:features");
        match self.handle.state() {
            SessionState::Connected => {
                #[cfg(feature = "tls")]
                if self.tls.is_some() && !self.secured && !self.cfg.direct_tls {
                    features = features.child(
                        Element::builder("starttls").ns(TLS_NAMESPACE).build(),
                    );
                }
                let mechanisms = advertised(
                    &self.deps.authenticator.mechanisms(),
                    self.transport.supports_channel_binding(),
                );
                features = features.child(
                    Element::builder("mechanisms")
                        .ns(SASL_NAMESPACE)
                        .children(mechanisms.iter().map(|m| {
                            Element::builder("mechanism").text(m.name()).build()
                        }))
                        .build(),
                );
            }
            _ => {
                features = features
                    .child(Element::builder("bind").ns(BIND_NAMESPACE).build())
                    .child(Element::builder("sm").ns(SM_NAMESPACE).build());
            }
        }
        features.build()
    }

    // =========================================================================
    // SASL
    // =========================================================================

    async fn handle_pre_auth(&mut self, el: Element) -> Result<Flow> {
        match (el.name(), el.namespace()) {
            ("starttls", Some(TLS_NAMESPACE)) => self.handle_starttls().await,
            ("auth", Some(SASL_NAMESPACE)) => {
                let Some(mechanism) = el
                    .attribute("mechanism")
                    .and_then(SaslMechanism::from_name)
                else {
                    self.write_sasl_failure("invalid-mechanism").await?;
                    return Ok(Flow::Continue);
                };
                let mut session = match self.deps.authenticator.start(mechanism).await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(stream_id = self.handle.id, error = %e, "authenticator start failed");
                        self.write_sasl_failure("temporary-auth-failure").await?;
                        return Ok(Flow::Continue);
                    }
                };
                let Some(initial) = decode_sasl_payload(el.text()) else {
                    self.write_sasl_failure("incorrect-encoding").await?;
                    return Ok(Flow::Continue);
                };
                let outcome = session.step(&initial).await;
                self.auth_session = Some(session);
                self.apply_sasl_outcome(outcome).await
            }
            _ => {
                tracing::debug!(stream_id = self.handle.id, element = el.name(), "unexpected pre-auth element");
                Ok(Flow::Close(Some(StreamErrorCondition::NotAuthorized)))
            }
        }
    }

    async fn handle_auth_response(&mut self, el: Element) -> Result<Flow> {
        match (el.name(), el.namespace()) {
            ("response", Some(SASL_NAMESPACE)) => {
                let Some(payload) = decode_sasl_payload(el.text()) else {
                    self.write_sasl_failure("incorrect-encoding").await?;
                    self.auth_session = None;
                    self.handle.set_state(SessionState::Connected);
                    return Ok(Flow::Continue);
                };
                let Some(mut session) = self.auth_session.take() else {
                    return Ok(Flow::Close(Some(StreamErrorCondition::NotAuthorized)));
                };
                let outcome = session.step(&payload).await;
                self.auth_session = Some(session);
                self.apply_sasl_outcome(outcome).await
            }
            ("abort", Some(SASL_NAMESPACE)) => {
                self.auth_session = None;
                self.handle.set_state(SessionState::Connected);
                self.write_sasl_failure("aborted").await?;
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Close(Some(StreamErrorCondition::NotAuthorized))),
        }
    }

    async fn apply_sasl_outcome(&mut self, outcome: Result<SaslOutcome>) -> Result<Flow> {
        match outcome {
            Ok(SaslOutcome::Challenge(data)) => {
                self.handle.set_state(SessionState::Authenticating);
                let challenge = Element::builder("challenge")
                    .ns(SASL_NAMESPACE)
                    .text(BASE64.encode(data))
                    .build();
                self.transport.write_element(&challenge).await?;
                self.transport.flush().await?;
                Ok(Flow::Continue)
            }
            Ok(SaslOutcome::Success { username }) => {
                if let (Some(limiter), Some(ip)) = (&self.auth_limiter, self.peer_ip) {
                    limiter.record_success(ip).await;
                }
                tracing::info!(stream_id = self.handle.id, username = %username, "stream authenticated");
                self.auth_username = Some(username);
                self.auth_session = None;
                self.handle.set_state(SessionState::Authenticated);
                let success = Element::builder("success").ns(SASL_NAMESPACE).build();
                self.transport.write_element(&success).await?;
                self.transport.flush().await?;
                Ok(Flow::Continue)
            }
            Ok(SaslOutcome::Failure) => {
                if let (Some(limiter), Some(ip)) = (&self.auth_limiter, self.peer_ip) {
                    limiter.record_failure(ip).await;
                }
                self.auth_session = None;
                self.handle.set_state(SessionState::Connected);
                self.write_sasl_failure("not-authorized").await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                tracing::warn!(stream_id = self.handle.id, error = %e, "sasl exchange failed");
                self.auth_session = None;
                self.handle.set_state(SessionState::Connected);
                self.write_sasl_failure("temporary-auth-failure").await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn write_sasl_failure(&mut self, condition: &str) -> Result<()> {
        let failure = Element::builder("failure")
            .ns(SASL_NAMESPACE)
            .child(Element::builder(condition).build())
            .build();
        self.transport.write_element(&failure).await?;
        self.transport.flush().await
    }

    async fn handle_starttls(&mut self) -> Result<Flow> {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.clone() {
            if self.secured {
                return Ok(Flow::Close(Some(StreamErrorCondition::PolicyViolation)));
            }
            let proceed = Element::builder("proceed").ns(TLS_NAMESPACE).build();
            self.transport.write_element(&proceed).await?;
            self.transport.flush().await?;
            self.transport.starttls(&tls).await?;
            self.secured = true;
            tracing::debug!(stream_id = self.handle.id, "stream secured via starttls");
            // Stream restarts over the secured transport.
            return Ok(Flow::Continue);
        }

        let failure = Element::builder("failure").ns(TLS_NAMESPACE).build();
        self.transport.write_element(&failure).await?;
        self.transport.flush().await?;
        Ok(Flow::Close(None))
    }

    // =========================================================================
    // Binding
    // =========================================================================

    async fn handle_pre_bind(&mut self, el: Element) -> Result<Flow> {
        // Stream management resume is claimed here by its hook handler,
        // before any default processing.
        if self
            .run_stream_hook(HookKind::C2SStreamElementReceived, Some(el.clone()))
            .await
        {
            return Ok(Flow::Continue);
        }

        let is_bind_request = el.name() == "iq"
            && el.attribute(ATTR_TYPE) == Some("set")
            && el.child_ns("bind", BIND_NAMESPACE).is_some();
        if is_bind_request {
            return self.process_bind(el).await;
        }

        if el.name() == "iq"
            && matches!(el.attribute(ATTR_TYPE), Some("get") | Some("set"))
        {
            self.reply_iq_error(&el, StanzaErrorCondition::ServiceUnavailable)
                .await?;
        }
        Ok(Flow::Continue)
    }

    async fn process_bind(&mut self, iq: Element) -> Result<Flow> {
        let Some(username) = self.auth_username.clone() else {
            return Ok(Flow::Close(Some(StreamErrorCondition::NotAuthorized)));
        };
        self.handle.set_state(SessionState::Binding);

        let requested = iq
            .child_ns("bind", BIND_NAMESPACE)
            .and_then(|b| b.child("resource"))
            .map(|r| r.text().to_owned())
            .filter(|r| !r.is_empty());
        let resource = requested.unwrap_or_else(|| Uuid::new_v4().to_string());

        let jid = match Jid::new(Some(&username), &self.domain, Some(&resource)) {
            Ok(jid) => jid,
            Err(e) => {
                tracing::info!(stream_id = self.handle.id, error = %e, "bind rejected");
                self.handle.set_state(SessionState::Authenticated);
                self.reply_iq_error(&iq, StanzaErrorCondition::ServiceUnavailable)
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        // Same full JID bound twice: the newcomer wins, the old stream
        // is closed with conflict.
        if let Some(old) = self
            .deps
            .router
            .local_router()
            .get(&username, &resource)
        {
            if old.id() != self.handle.id {
                old.disconnect(StreamErrorCondition::Conflict).await;
            }
        }

        *self.handle.jid.write().expect("session jid lock poisoned") = Some(jid.clone());
        self.deps
            .router
            .local_router()
            .register(self.handle.as_dyn());

        let desc = ResourceDesc {
            instance_id: self.deps.local_instance_id.clone(),
            jid: jid.clone(),
            presence: None,
            info: self.handle.info(),
        };
        if let Err(e) = self.deps.directory.put(desc).await {
            tracing::error!(stream_id = self.handle.id, error = %e, "failed to publish resource record");
            self.deps
                .router
                .local_router()
                .unregister(&self.handle.as_dyn());
            *self.handle.jid.write().expect("session jid lock poisoned") = None;
            self.handle.set_state(SessionState::Authenticated);
            self.reply_iq_error(&iq, StanzaErrorCondition::InternalServerError)
                .await?;
            return Ok(Flow::Continue);
        }

        self.handle.set_state(SessionState::Bound);
        tracing::info!(stream_id = self.handle.id, jid = %jid, "stream bound");

        let mut result = Element::builder("iq").attr(ATTR_TYPE, "result");
        if let Some(id) = iq.attribute(ATTR_ID) {
            result = result.attr(ATTR_ID, id);
        }
        let result = result
            .child(
                Element::builder("bind")
                    .ns(BIND_NAMESPACE)
                    .child(Element::builder("jid").text(jid.to_string()).build())
                    .build(),
            )
            .build();
        self.transport.write_element(&result).await?;
        self.transport.flush().await?;

        self.run_stream_hook(HookKind::C2SStreamBinded, None).await;
        Ok(Flow::Continue)
    }

    // =========================================================================
    // Bound stanza exchange
    // =========================================================================

    async fn handle_bound(&mut self, el: Element) -> Result<Flow> {
        if self
            .run_stream_hook(HookKind::C2SStreamElementReceived, Some(el.clone()))
            .await
        {
            return Ok(Flow::Continue);
        }

        if StanzaKind::from_name(el.name()).is_none() {
            tracing::debug!(stream_id = self.handle.id, element = el.name(), "ignoring unhandled element");
            return Ok(Flow::Continue);
        }

        let Some(jid) = self.handle.jid() else {
            return Ok(Flow::Continue);
        };

        let mut el = el;
        el.set_attribute(ATTR_FROM, jid.to_string());

        if el.attribute(ATTR_TO).is_none() {
            return self.handle_self_addressed(el, &jid).await;
        }

        let stanza = match Stanza::try_from(el) {
            Ok(stanza) => stanza,
            Err(e) => {
                tracing::info!(stream_id = self.handle.id, error = %e, "dropping malformed stanza");
                return Ok(Flow::Continue);
            }
        };
        if let Err(e) = self.deps.router.route(stanza).await {
            tracing::debug!(stream_id = self.handle.id, error = %e, "stanza undeliverable");
        }
        Ok(Flow::Continue)
    }

    /// Stanzas without a recipient address: broadcast presence updates
    /// the directory record, messages bounce to the sender's bare JID,
    /// iq requests target the server itself (no core module answers
    /// them).
    async fn handle_self_addressed(&mut self, el: Element, jid: &Jid) -> Result<Flow> {
        match el.name() {
            "presence" => {
                let presence = if presence_is_available(&el) {
                    Some(el.clone())
                } else {
                    None
                };
                let desc = ResourceDesc {
                    instance_id: self.deps.local_instance_id.clone(),
                    jid: jid.clone(),
                    presence,
                    info: self.handle.info(),
                };
                if let Err(e) = self.deps.directory.put(desc).await {
                    tracing::warn!(stream_id = self.handle.id, error = %e, "failed to update presence record");
                }
            }
            "message" => {
                let mut el = el;
                el.set_attribute(ATTR_TO, jid.to_bare().to_string());
                if let Ok(stanza) = Stanza::try_from(el) {
                    if let Err(e) = self.deps.router.route(stanza).await {
                        tracing::debug!(stream_id = self.handle.id, error = %e, "stanza undeliverable");
                    }
                }
            }
            "iq" => {
                if matches!(el.attribute(ATTR_TYPE), Some("get") | Some("set")) {
                    self.reply_iq_error(&el, StanzaErrorCondition::ServiceUnavailable)
                        .await?;
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    async fn reply_iq_error(&mut self, iq: &Element, condition: StanzaErrorCondition) -> Result<()> {
        if let Ok(stanza) = Stanza::try_from(iq.clone()) {
            if let Some(reply) = error_reply(&stanza, condition) {
                let mut el = reply.into_element();
                el.remove_attribute(ATTR_TO);
                el.remove_attribute(ATTR_FROM);
                self.transport.write_element(&el).await?;
                self.transport.flush().await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn hibernate(&mut self) {
        self.handle.set_state(SessionState::Hibernated);
        tracing::info!(
            stream_id = self.handle.id,
            jid = %self.handle.jid().map(|j| j.to_string()).unwrap_or_default(),
            "stream hibernated"
        );
        self.run_stream_hook(HookKind::C2SStreamHibernated, None).await;
    }

    /// Run a C2S stream hook; returns whether a handler halted.
    async fn run_stream_hook(&self, kind: HookKind, element: Option<Element>) -> bool {
        let mut ctx = ExecutionContext::with_stream(
            HookInfo::C2SStream(C2SStreamInfo {
                id: self.handle.id,
                jid: self.handle.jid(),
                element,
            }),
            self.handle.as_dyn(),
        );
        match self.deps.hooks.run(kind, &mut ctx).await {
            Ok(halted) => halted,
            Err(e) => {
                tracing::warn!(stream_id = self.handle.id, kind = ?kind, error = %e, "stream hook failed");
                true
            }
        }
    }
}

/// Decode a SASL text payload: `=` denotes an empty response.
fn decode_sasl_payload(text: &str) -> Option<Vec<u8>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Some(Vec::new());
    }
    BASE64.decode(trimmed).ok()
}
