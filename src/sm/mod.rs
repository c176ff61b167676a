//! Stream management (XEP-0198).
//!
//! The manager subscribes to the stream hooks of bound sessions and
//! owns the whole protocol: `<enable/>`, the ack counters, `<r/>`/`<a/>`
//! exchange, hibernation, and resumption — including adopting a queue
//! hibernated on another cluster node via the `TransferQueue` RPC.

pub mod queue;

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;

use crate::cluster::directory::KvResourceDirectory;
use crate::cluster::error::ClusterError;
use crate::cluster::link::ClusterLinkManager;
use crate::config::SmConfig;
use crate::constants::{SM_MAX_SMID_JID_LENGTH, SM_NAMESPACE, SM_NONCE_LENGTH};
use crate::error::Result;
use crate::hook::{
    ExecutionContext, FnHandler, HookInfo, HookKind, HookOutcome, Hooks, PRIORITY_HIGHEST,
};
use crate::info::{INFO_SM_ENABLED, InfoMap};
use crate::jid::Jid;
use crate::router::local::LocalRouter;
use crate::router::stream::C2sStream;
use crate::xmpp::{Element, StanzaKind, StreamErrorCondition};

use queue::{QueueMap, StreamQueue, seq_lt};

/// Queue-map lookup key for a full JID.
pub fn queue_key(jid: &Jid) -> String {
    format!(
        "{}/{}",
        jid.node().unwrap_or_default(),
        jid.resource().unwrap_or_default()
    )
}

/// SMID = base64(full JID bytes ‖ 24-byte nonce).
pub fn encode_smid(jid: &Jid, nonce: &[u8; SM_NONCE_LENGTH]) -> String {
    let mut raw = jid.to_string().into_bytes();
    raw.extend_from_slice(nonce);
    BASE64.encode(raw)
}

/// Invalid SMID presented on resume.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed stream management id")]
pub struct SmidError;

/// Decode an SMID back into its JID and nonce.
///
/// Tolerates up to 256 bytes of JID; anything shorter than one JID byte
/// plus the nonce is rejected.
pub fn decode_smid(smid: &str) -> std::result::Result<(Jid, [u8; SM_NONCE_LENGTH]), SmidError> {
    let raw = BASE64.decode(smid).map_err(|_| SmidError)?;
    if raw.len() <= SM_NONCE_LENGTH || raw.len() > SM_MAX_SMID_JID_LENGTH + SM_NONCE_LENGTH {
        return Err(SmidError);
    }
    let (jid_bytes, nonce_bytes) = raw.split_at(raw.len() - SM_NONCE_LENGTH);
    let jid: Jid = std::str::from_utf8(jid_bytes)
        .map_err(|_| SmidError)?
        .parse()
        .map_err(|_| SmidError)?;
    if jid.node().is_none() || jid.resource().is_none() {
        return Err(SmidError);
    }
    let nonce: [u8; SM_NONCE_LENGTH] = nonce_bytes.try_into().map_err(|_| SmidError)?;
    Ok((jid, nonce))
}

/// The XEP-0198 protocol engine.
pub struct StreamManager {
    cfg: SmConfig,
    hooks: Arc<Hooks>,
    queues: Arc<QueueMap>,
    router: Arc<LocalRouter>,
    directory: Arc<KvResourceDirectory>,
    links: Arc<ClusterLinkManager>,
    local_instance_id: String,
}

impl StreamManager {
    pub fn new(
        cfg: SmConfig,
        hooks: Arc<Hooks>,
        queues: Arc<QueueMap>,
        router: Arc<LocalRouter>,
        directory: Arc<KvResourceDirectory>,
        links: Arc<ClusterLinkManager>,
        local_instance_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            hooks,
            queues,
            router,
            directory,
            links,
            local_instance_id: local_instance_id.into(),
        })
    }

    /// Register the hook handlers. SM observes elements before any
    /// other handler so its nonzas never reach default processing.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        self.hooks.add(
            HookKind::C2SStreamElementReceived,
            PRIORITY_HIGHEST,
            Arc::new(FnHandler(move |ctx: &mut ExecutionContext| {
                let this = this.clone();
                let (stream, element) = extract_stream_element(ctx);
                async move {
                    match (stream, element) {
                        (Some(stream), Some(element)) => {
                            this.on_element_received(stream, element).await
                        }
                        _ => Ok(HookOutcome::Continue),
                    }
                }
            })),
        );

        let this = self.clone();
        self.hooks.add(
            HookKind::C2SStreamElementSent,
            PRIORITY_HIGHEST,
            Arc::new(FnHandler(move |ctx: &mut ExecutionContext| {
                let this = this.clone();
                let (stream, element) = extract_stream_element(ctx);
                async move {
                    match (stream, element) {
                        (Some(stream), Some(element)) => {
                            this.on_element_sent(stream, element).await
                        }
                        _ => Ok(HookOutcome::Continue),
                    }
                }
            })),
        );

        let this = self.clone();
        self.hooks.add(
            HookKind::C2SStreamHibernated,
            PRIORITY_HIGHEST,
            Arc::new(FnHandler(move |ctx: &mut ExecutionContext| {
                let this = this.clone();
                let stream = ctx.stream().cloned();
                async move {
                    if let Some(stream) = stream {
                        this.on_hibernated(stream).await;
                    }
                    Ok(HookOutcome::Continue)
                }
            })),
        );

        let this = self.clone();
        self.hooks.add(
            HookKind::C2SStreamDisconnected,
            PRIORITY_HIGHEST,
            Arc::new(FnHandler(move |ctx: &mut ExecutionContext| {
                let this = this.clone();
                let (id, jid) = match &ctx.info {
                    HookInfo::C2SStream(info) => (info.id, info.jid.clone()),
                    _ => (0, None),
                };
                async move {
                    if let Some(jid) = jid {
                        // A conflicting re-bind may already own this
                        // key; leave its queue alone.
                        let rebound = this
                            .router
                            .get(
                                jid.node().unwrap_or_default(),
                                jid.resource().unwrap_or_default(),
                            )
                            .is_some_and(|s| s.id() != id);
                        if !rebound {
                            if let Some(queue) = this.queues.detach(&queue_key(&jid)) {
                                queue.cancel_timers();
                                tracing::debug!(queue = %queue.key(), "dropped queue of disconnected stream");
                            }
                        }
                    }
                    Ok(HookOutcome::Continue)
                }
            })),
        );

        tracing::info!("started stream management");
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn on_element_received(
        &self,
        stream: Arc<dyn C2sStream>,
        element: Element,
    ) -> Result<HookOutcome> {
        if element.namespace() == Some(SM_NAMESPACE) {
            match element.name() {
                "enable" => self.handle_enable(stream).await?,
                "resume" => self.handle_resume(stream, &element).await?,
                "r" => self.handle_r(stream).await?,
                "a" => self.handle_a(stream, &element).await?,
                other => {
                    tracing::debug!(element = other, "ignoring unknown sm element");
                }
            }
            return Ok(HookOutcome::Halt);
        }

        // Count consumed stanzas on enabled streams.
        if StanzaKind::from_name(element.name()).is_some()
            && stream.info().bool_value(INFO_SM_ENABLED)
        {
            if let Some(queue) = self.queue_for(&stream) {
                queue.inc_in_h();
            }
        }
        Ok(HookOutcome::Continue)
    }

    async fn on_element_sent(
        &self,
        stream: Arc<dyn C2sStream>,
        element: Element,
    ) -> Result<HookOutcome> {
        if StanzaKind::from_name(element.name()).is_none()
            || !stream.info().bool_value(INFO_SM_ENABLED)
        {
            return Ok(HookOutcome::Continue);
        }
        let Some(queue) = self.queue_for(&stream) else {
            return Ok(HookOutcome::Continue);
        };
        let Ok(stanza) = crate::xmpp::Stanza::try_from(element) else {
            return Ok(HookOutcome::Continue);
        };
        if queue.push(stanza).is_err() {
            tracing::info!(queue = %queue.key(), "stream queue overflow, disconnecting");
            stream.disconnect(StreamErrorCondition::PolicyViolation).await;
        }
        Ok(HookOutcome::Continue)
    }

    // =========================================================================
    // Enable
    // =========================================================================

    async fn handle_enable(&self, stream: Arc<dyn C2sStream>) -> Result<()> {
        if !stream.is_bound() {
            return self.send_failed(&stream, "unexpected-request").await;
        }
        let Some(jid) = stream.jid() else {
            return self.send_failed(&stream, "unexpected-request").await;
        };
        if stream.info().bool_value(INFO_SM_ENABLED) {
            return self.send_failed(&stream, "unexpected-request").await;
        }

        let mut nonce = [0u8; SM_NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);

        let queue = StreamQueue::new(
            queue_key(&jid),
            nonce,
            self.cfg.clone(),
            self.router.clone(),
        );
        self.queues.insert(queue);
        stream.set_info_value(INFO_SM_ENABLED, "true").await;

        let smid = encode_smid(&jid, &nonce);
        let enabled = Element::builder("enabled")
            .ns(SM_NAMESPACE)
            .attr("id", &smid)
            .attr("resume", "true")
            .attr("max", self.cfg.hibernate_time_secs.to_string())
            .build();
        stream.send_element_untracked(enabled).await?;

        tracing::info!(jid = %jid, "stream management enabled");
        Ok(())
    }

    // =========================================================================
    // Acks
    // =========================================================================

    async fn handle_r(&self, stream: Arc<dyn C2sStream>) -> Result<()> {
        let Some(queue) = self.queue_for(&stream) else {
            return Ok(());
        };
        let a = Element::builder("a")
            .ns(SM_NAMESPACE)
            .attr("h", queue.in_h().to_string())
            .build();
        stream.send_element_untracked(a).await
    }

    async fn handle_a(&self, stream: Arc<dyn C2sStream>, element: &Element) -> Result<()> {
        let Some(queue) = self.queue_for(&stream) else {
            return Ok(());
        };
        let h: u32 = element
            .attribute("h")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if queue.ack_up_to(h).is_err() {
            tracing::info!(queue = %queue.key(), h, "ack beyond outbound counter");
            stream.disconnect(StreamErrorCondition::PolicyViolation).await;
        }
        Ok(())
    }

    // =========================================================================
    // Hibernation
    // =========================================================================

    async fn on_hibernated(self: &Arc<Self>, stream: Arc<dyn C2sStream>) {
        let Some(jid) = stream.jid() else { return };
        let key = queue_key(&jid);
        let Some(queue) = self.queues.get(&key) else {
            return;
        };

        let this = self.clone();
        let gc_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.cfg.hibernate_time()).await;
            this.expire_hibernated(&gc_key).await;
        });
        queue.set_hibernate_task(handle);
        tracing::debug!(queue = %key, "hibernation timer armed");
    }

    /// The hibernation window elapsed without a resume: drop the queue,
    /// tear down the stream's remains and announce the departure.
    async fn expire_hibernated(&self, key: &str) {
        let Some(queue) = self.queues.detach(key) else {
            return;
        };
        queue.cancel_timers();
        tracing::info!(queue = %key, "hibernated stream expired");

        if let Some((user, resource)) = key.split_once('/') {
            if let Some(stream) = self.router.get(user, resource) {
                stream
                    .disconnect(StreamErrorCondition::ConnectionTimeout)
                    .await;
            }
        }

        let mut ctx = ExecutionContext::new(HookInfo::Empty);
        if let Err(e) = self.hooks.run(HookKind::StreamGone, &mut ctx).await {
            tracing::warn!(error = %e, "stream gone hook failed");
        }
    }

    // =========================================================================
    // Resume
    // =========================================================================

    async fn handle_resume(&self, stream: Arc<dyn C2sStream>, element: &Element) -> Result<()> {
        // Only a fresh, authenticated, not-yet-bound stream may resume.
        if stream.is_bound() {
            return self.send_failed(&stream, "unexpected-request").await;
        }

        let Some((jid, nonce)) = element
            .attribute("previd")
            .and_then(|previd| decode_smid(previd).ok())
        else {
            return self.send_failed(&stream, "item-not-found").await;
        };
        let h: u32 = element
            .attribute("h")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let key = queue_key(&jid);

        // Local attempt first: the atomic detach also serializes two
        // concurrent resumes of the same smid.
        if let Some(queue) = self.queues.detach_if(&key, |q| q.nonce() == &nonce) {
            return self.install_queue(stream, queue, jid, h).await;
        }

        // Not owned here: find the owning instance and pull the queue
        // over a cluster link.
        let desc = match self
            .directory
            .get(jid.node().unwrap_or_default(), jid.resource().unwrap_or_default())
            .await
        {
            Ok(Some(desc)) if desc.instance_id != self.local_instance_id => desc,
            Ok(_) => return self.send_failed(&stream, "item-not-found").await,
            Err(e) => {
                tracing::warn!(jid = %jid, error = %e, "resume directory lookup failed");
                return self.send_failed(&stream, "item-not-found").await;
            }
        };

        let snapshot = match self
            .links
            .transfer_queue(&desc.instance_id, &key)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(ClusterError::NotFound) => {
                return self.send_failed(&stream, "item-not-found").await;
            }
            Err(e) => {
                // Owning node unreachable: the client re-binds fresh.
                tracing::warn!(jid = %jid, instance_id = %desc.instance_id, error = %e, "queue transfer failed");
                return self.send_failed(&stream, "item-not-found").await;
            }
        };

        if snapshot.nonce != nonce {
            tracing::info!(jid = %jid, "resume nonce mismatch after transfer");
            return self.send_failed(&stream, "item-not-found").await;
        }

        let queue = match StreamQueue::from_snapshot(
            key,
            snapshot,
            self.cfg.clone(),
            self.router.clone(),
        ) {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(jid = %jid, error = %e, "transferred queue is malformed");
                return self.send_failed(&stream, "item-not-found").await;
            }
        };

        let instance_id = desc.instance_id.clone();
        let result = self.install_queue(stream, queue, jid.clone(), h).await;

        // Best effort: the previous node still holds a hibernated
        // stream object for this JID; conflict it out.
        if result.is_ok() {
            if let Err(e) = self
                .links
                .disconnect_stream(&instance_id, &jid, StreamErrorCondition::Conflict)
                .await
            {
                tracing::debug!(jid = %jid, error = %e, "failed to disconnect remote hibernated stream");
            }
        }
        result
    }

    /// Attach a detached queue to a fresh stream and replay.
    async fn install_queue(
        &self,
        stream: Arc<dyn C2sStream>,
        queue: Arc<StreamQueue>,
        jid: Jid,
        h: u32,
    ) -> Result<()> {
        queue.cancel_timers();

        if seq_lt(queue.out_h(), h) {
            tracing::info!(jid = %jid, h, out_h = queue.out_h(), "resume ack beyond outbound counter");
            stream.disconnect(StreamErrorCondition::PolicyViolation).await;
            return Ok(());
        }
        if queue.ack_up_to(h).is_err() {
            stream.disconnect(StreamErrorCondition::PolicyViolation).await;
            return Ok(());
        }

        let mut info = InfoMap::new();
        info.set_bool(INFO_SM_ENABLED, true);
        stream.resume(jid.clone(), None, info).await?;
        self.queues.insert(queue.clone());

        let resumed = Element::builder("resumed")
            .ns(SM_NAMESPACE)
            .attr("previd", encode_smid(&jid, queue.nonce()))
            .attr("h", queue.in_h().to_string())
            .build();
        stream.send_element_untracked(resumed).await?;

        // Replay precedes any new traffic; elements keep their original
        // sequence numbers and stay queued until acked.
        for el in queue.elements() {
            stream
                .send_element_untracked(el.stanza.element().clone())
                .await?;
        }
        queue.schedule_request_ack();

        let mut ctx = ExecutionContext::with_stream(
            HookInfo::C2SStream(crate::hook::C2SStreamInfo {
                id: stream.id(),
                jid: Some(jid.clone()),
                element: None,
            }),
            stream.clone(),
        );
        if let Err(e) = self.hooks.run(HookKind::C2SStreamResumed, &mut ctx).await {
            tracing::warn!(error = %e, "stream resumed hook failed");
        }

        tracing::info!(jid = %jid, pending = queue.len(), "stream resumed");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn queue_for(&self, stream: &Arc<dyn C2sStream>) -> Option<Arc<StreamQueue>> {
        let jid = stream.jid()?;
        self.queues.get(&queue_key(&jid))
    }

    async fn send_failed(&self, stream: &Arc<dyn C2sStream>, condition: &str) -> Result<()> {
        let failed = Element::builder("failed")
            .ns(SM_NAMESPACE)
            .child(
                Element::builder(condition)
                    .ns("urn:ietf:params:xml:ns:xmpp-stanzas")
                    .build(),
            )
            .build();
        stream.send_element_untracked(failed).await
    }
}

fn extract_stream_element(
    ctx: &ExecutionContext,
) -> (Option<Arc<dyn C2sStream>>, Option<Element>) {
    let stream = ctx.stream().cloned();
    let element = match &ctx.info {
        HookInfo::C2SStream(info) => info.element.clone(),
        _ => None,
    };
    (stream, element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smid_round_trip() {
        let jid: Jid = "alice@chorus.im/orchard".parse().unwrap();
        let mut nonce = [0u8; SM_NONCE_LENGTH];
        for (i, b) in nonce.iter_mut().enumerate() {
            *b = (i + 1) as u8;
        }
        let smid = encode_smid(&jid, &nonce);
        let (decoded_jid, decoded_nonce) = decode_smid(&smid).unwrap();
        assert_eq!(decoded_jid, jid);
        assert_eq!(decoded_nonce, nonce);
    }

    #[test]
    fn test_smid_is_base64_of_jid_and_nonce() {
        let jid: Jid = "alice@chorus.im/orchard".parse().unwrap();
        let nonce = [0xAB; SM_NONCE_LENGTH];
        let smid = encode_smid(&jid, &nonce);
        let raw = BASE64.decode(&smid).unwrap();
        assert!(raw.starts_with(b"alice@chorus.im/orchard"));
        assert_eq!(&raw[raw.len() - SM_NONCE_LENGTH..], &nonce);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_smid("!!!").is_err());
        // Nonce alone, no JID bytes.
        assert!(decode_smid(&BASE64.encode([0u8; SM_NONCE_LENGTH])).is_err());
        // Bare JID inside the smid.
        let bare: Jid = "alice@chorus.im".parse().unwrap();
        let smid = {
            let mut raw = bare.to_string().into_bytes();
            raw.extend_from_slice(&[1u8; SM_NONCE_LENGTH]);
            BASE64.encode(raw)
        };
        assert!(decode_smid(&smid).is_err());
    }

    #[test]
    fn test_decode_tolerates_long_jid_up_to_limit() {
        let node = "n".repeat(200);
        let jid: Jid = format!("{node}@chorus.im/r").parse().unwrap();
        let smid = encode_smid(&jid, &[5u8; SM_NONCE_LENGTH]);
        assert!(decode_smid(&smid).is_ok());

        let mut raw = vec![b'x'; SM_MAX_SMID_JID_LENGTH + 1];
        raw.extend_from_slice(&[5u8; SM_NONCE_LENGTH]);
        assert!(decode_smid(&BASE64.encode(raw)).is_err());
    }
}
