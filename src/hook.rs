//! In-process synchronous event dispatch.
//!
//! Components communicate through a process-local hook bus: handlers are
//! registered per event kind with a priority, and `run` invokes them in
//! ascending priority order. A handler may *halt* the chain, which in
//! router usage suppresses default delivery (the handler owned the
//! stanza), and in stream usage suppresses default element processing.
//!
//! The bus serializes handlers within one `run` invocation but not
//! across invocations; handlers must be reentrant and must not block
//! indefinitely. There is no cross-process propagation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::cluster::directory::ResourceDesc;
use crate::cluster::member::Member;
use crate::error::Result;
use crate::jid::Jid;
use crate::router::stream::C2sStream;
use crate::xmpp::{Element, Stanza};

/// Priority of handlers that must observe an event first.
pub const PRIORITY_HIGHEST: i32 = i32::MIN;

/// Default handler priority.
pub const PRIORITY_DEFAULT: i32 = 0;

/// Priority of handlers that must observe an event last.
pub const PRIORITY_LOWEST: i32 = i32::MAX;

/// Event kinds dispatched on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    // C2S stream lifecycle.
    C2SStreamConnected,
    C2SStreamBinded,
    C2SStreamElementReceived,
    C2SStreamElementSent,
    C2SStreamHibernated,
    C2SStreamResumed,
    C2SStreamDisconnected,
    /// A hibernated stream expired without resumption.
    StreamGone,

    // Routing.
    PreRoute,
    WillRoute,
    DidRoute,
    OfflineMessage,

    // Cluster.
    MemberListUpdated,
    ResourceDirectoryChanged,
}

/// Payload attached to a C2S stream event.
#[derive(Debug, Clone, Default)]
pub struct C2SStreamInfo {
    pub id: u64,
    pub jid: Option<Jid>,
    pub element: Option<Element>,
}

/// Payload attached to routing events.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub stanza: Stanza,
}

/// Payload attached to `MemberListUpdated`.
#[derive(Debug, Clone, Default)]
pub struct MemberListInfo {
    pub registered: Vec<Member>,
    pub unregistered_keys: Vec<String>,
}

/// Payload attached to `ResourceDirectoryChanged`.
#[derive(Debug, Clone, Default)]
pub struct ResourceDirectoryInfo {
    pub updated: Vec<ResourceDesc>,
    pub removed_keys: Vec<String>,
}

/// Typed event payload carried in the execution context.
#[derive(Debug, Clone)]
pub enum HookInfo {
    C2SStream(C2SStreamInfo),
    Route(RouteInfo),
    MemberList(MemberListInfo),
    ResourceDirectory(ResourceDirectoryInfo),
    Empty,
}

/// The component that emitted the event, when handlers need to act on it.
#[derive(Clone)]
pub enum HookSender {
    Stream(Arc<dyn C2sStream>),
}

/// Mutable context threaded through a handler chain.
pub struct ExecutionContext {
    pub info: HookInfo,
    pub sender: Option<HookSender>,
}

impl ExecutionContext {
    pub fn new(info: HookInfo) -> Self {
        Self { info, sender: None }
    }

    pub fn with_stream(info: HookInfo, stream: Arc<dyn C2sStream>) -> Self {
        Self {
            info,
            sender: Some(HookSender::Stream(stream)),
        }
    }

    /// The emitting stream, when the sender is one.
    pub fn stream(&self) -> Option<&Arc<dyn C2sStream>> {
        match &self.sender {
            Some(HookSender::Stream(stm)) => Some(stm),
            None => None,
        }
    }
}

/// What a handler instructs the bus to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Keep running lower-priority handlers, then the default behavior.
    Continue,
    /// Stop the chain and suppress the default behavior.
    Halt,
}

/// A single hook handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<HookOutcome>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(&mut ExecutionContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<HookOutcome>> + Send,
{
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<HookOutcome> {
        (self.0)(ctx).await
    }
}

/// Opaque handle identifying a registration, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    priority: i32,
    handler: Arc<dyn Handler>,
}

/// The process-local hook registry.
///
/// Explicitly constructed and shared via `Arc`; there is no global
/// instance.
#[derive(Default)]
pub struct Hooks {
    handlers: RwLock<HashMap<HookKind, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event kind.
    ///
    /// Handlers run in ascending priority order; ties run in
    /// registration order.
    pub fn add(&self, kind: HookKind, priority: i32, handler: Arc<dyn Handler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().expect("hooks lock poisoned");
        let regs = handlers.entry(kind).or_default();
        let pos = regs.partition_point(|r| r.priority <= priority);
        regs.insert(
            pos,
            Registration {
                id,
                priority,
                handler,
            },
        );
        id
    }

    /// Remove a previously registered handler.
    pub fn remove(&self, kind: HookKind, id: HandlerId) {
        let mut handlers = self.handlers.write().expect("hooks lock poisoned");
        if let Some(regs) = handlers.get_mut(&kind) {
            regs.retain(|r| r.id != id);
        }
    }

    /// Dispatch an event.
    ///
    /// Returns `Ok(true)` if a handler halted the chain. An error from a
    /// handler stops the chain and propagates.
    pub async fn run(&self, kind: HookKind, ctx: &mut ExecutionContext) -> Result<bool> {
        let snapshot: Vec<Arc<dyn Handler>> = {
            let handlers = self.handlers.read().expect("hooks lock poisoned");
            handlers
                .get(&kind)
                .map(|regs| regs.iter().map(|r| r.handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            match handler.run(ctx).await? {
                HookOutcome::Continue => {}
                HookOutcome::Halt => return Ok(true),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handler(
        log: Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
        outcome: HookOutcome,
    ) -> Arc<dyn Handler> {
        Arc::new(FnHandler(move |_ctx: &mut ExecutionContext| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(tag);
                Ok(outcome)
            }
        }))
    }

    #[tokio::test]
    async fn test_handlers_run_in_ascending_priority() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        hooks.add(
            HookKind::PreRoute,
            10,
            recording_handler(log.clone(), "second", HookOutcome::Continue),
        );
        hooks.add(
            HookKind::PreRoute,
            -10,
            recording_handler(log.clone(), "first", HookOutcome::Continue),
        );

        let mut ctx = ExecutionContext::new(HookInfo::Empty);
        let halted = hooks.run(HookKind::PreRoute, &mut ctx).await.unwrap();

        assert!(!halted);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_halt_suppresses_later_handlers() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        hooks.add(
            HookKind::PreRoute,
            0,
            recording_handler(log.clone(), "halter", HookOutcome::Halt),
        );
        hooks.add(
            HookKind::PreRoute,
            1,
            recording_handler(log.clone(), "never", HookOutcome::Continue),
        );

        let mut ctx = ExecutionContext::new(HookInfo::Empty);
        let halted = hooks.run(HookKind::PreRoute, &mut ctx).await.unwrap();

        assert!(halted);
        assert_eq!(*log.lock().unwrap(), vec!["halter"]);
    }

    #[tokio::test]
    async fn test_error_stops_chain() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        hooks.add(
            HookKind::PreRoute,
            0,
            Arc::new(FnHandler(|_ctx: &mut ExecutionContext| async {
                Err(crate::error::Error::Config("boom".into()))
            })),
        );
        hooks.add(
            HookKind::PreRoute,
            1,
            recording_handler(log.clone(), "never", HookOutcome::Continue),
        );

        let mut ctx = ExecutionContext::new(HookInfo::Empty);
        assert!(hooks.run(HookKind::PreRoute, &mut ctx).await.is_err());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_handler_does_not_run() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = hooks.add(
            HookKind::DidRoute,
            0,
            recording_handler(log.clone(), "gone", HookOutcome::Continue),
        );
        hooks.remove(HookKind::DidRoute, id);

        let mut ctx = ExecutionContext::new(HookInfo::Empty);
        hooks.run(HookKind::DidRoute, &mut ctx).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_noop() {
        let hooks = Hooks::new();
        let mut ctx = ExecutionContext::new(HookInfo::Empty);
        let halted = hooks.run(HookKind::StreamGone, &mut ctx).await.unwrap();
        assert!(!halted);
    }
}
