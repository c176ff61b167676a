//! Stream management protocol tests: enable, ack counters, queue
//! bounds, hibernation and local resume, driven through the hook bus
//! with mock streams.

use std::sync::Arc;

use chorus::cluster::directory::ResourceDesc;
use chorus::cluster::kv::KV;
use chorus::cluster::kv::memory::MemoryKv;
use chorus::config::Config;
use chorus::hook::{C2SStreamInfo, ExecutionContext, HookInfo, HookKind};
use chorus::info::INFO_SM_ENABLED;
use chorus::node::Node;
use chorus::router::stream::C2sStream;
use chorus::router::test_support::MockStream;
use chorus::server::sasl::StaticAuthenticator;
use chorus::xmpp::{Element, StreamErrorCondition};

const SM_NS: &str = "urn:xmpp:sm:3";

async fn start_node(kv: Arc<dyn KV>, id: &str, max_queue_size: usize) -> Node {
    let mut config = Config::default();
    config.hosts = vec!["chorus.im".into()];
    config.cluster.bind_addr = "127.0.0.1:0".into();
    config.sm.max_queue_size = max_queue_size;
    Node::start_with_instance_id(
        config,
        kv,
        Arc::new(StaticAuthenticator::new()),
        None,
        Some(id.into()),
    )
    .await
    .unwrap()
}

async fn fire_received(node: &Node, stream: &Arc<MockStream>, element: Element) -> bool {
    let mut ctx = ExecutionContext::with_stream(
        HookInfo::C2SStream(C2SStreamInfo {
            id: stream.id(),
            jid: stream.jid(),
            element: Some(element),
        }),
        stream.clone(),
    );
    node.hooks()
        .run(HookKind::C2SStreamElementReceived, &mut ctx)
        .await
        .unwrap()
}

async fn fire_sent(node: &Node, stream: &Arc<MockStream>, element: Element) {
    let mut ctx = ExecutionContext::with_stream(
        HookInfo::C2SStream(C2SStreamInfo {
            id: stream.id(),
            jid: stream.jid(),
            element: Some(element),
        }),
        stream.clone(),
    );
    node.hooks()
        .run(HookKind::C2SStreamElementSent, &mut ctx)
        .await
        .unwrap();
}

fn enable_el() -> Element {
    Element::builder("enable")
        .ns(SM_NS)
        .attr("resume", "true")
        .build()
}

fn message(id: &str) -> Element {
    Element::builder("message")
        .attr("to", "alice@chorus.im/yard")
        .attr("from", "noelia@chorus.im/yard")
        .attr("id", id)
        .child(Element::builder("body").text("I'll give thee a wind.").build())
        .build()
}

/// Enable SM on a bound mock stream; returns the SMID.
async fn enable_sm(node: &Node, stream: &Arc<MockStream>) -> String {
    let halted = fire_received(node, stream, enable_el()).await;
    assert!(halted);

    let enabled = stream
        .sent()
        .into_iter()
        .find(|el| el.name() == "enabled")
        .expect("enabled reply");
    assert_eq!(enabled.namespace(), Some(SM_NS));
    assert_eq!(enabled.attribute("resume"), Some("true"));
    assert!(stream.info().bool_value(INFO_SM_ENABLED));
    stream.clear_sent();
    enabled.attribute("id").expect("smid").to_owned()
}

#[tokio::test]
async fn test_enable_creates_queue_and_replies() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let stream = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(stream.clone());

    let smid = enable_sm(&node, &stream).await;
    assert!(!smid.is_empty());

    let queue = node.queues().get("alice/yard").expect("queue created");
    assert_eq!(queue.out_h(), 0);
    assert_eq!(queue.in_h(), 0);
    queue.cancel_timers();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_enable_requires_bound_stream() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let stream = MockStream::new(1); // never bound
    let halted = fire_received(&node, &stream, enable_el()).await;
    assert!(halted);

    let failed = stream.sent().into_iter().find(|el| el.name() == "failed");
    assert!(failed.is_some());
    assert!(node.queues().is_empty());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_enable_then_acks_empty_the_queue() {
    // Scenario: client sends 3 messages; server requests ack; client
    // answers <a h='3'/>; queue must be empty.
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let stream = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(stream.clone());
    enable_sm(&node, &stream).await;

    for n in 1..=3 {
        fire_sent(&node, &stream, message(&format!("m{n}"))).await;
    }
    let queue = node.queues().get("alice/yard").unwrap();
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.out_h(), 3);

    let ack = Element::builder("a").ns(SM_NS).attr("h", "3").build();
    assert!(fire_received(&node, &stream, ack).await);
    assert!(queue.is_empty());
    queue.cancel_timers();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inbound_counter_and_r_reply() {
    // Scenario: after one inbound message, <r/> elicits <a h='1'/>.
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let stream = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(stream.clone());
    enable_sm(&node, &stream).await;

    let halted = fire_received(&node, &stream, message("m1")).await;
    assert!(!halted); // stanzas continue to default processing

    let queue = node.queues().get("alice/yard").unwrap();
    assert_eq!(queue.in_h(), 1);

    let r = Element::builder("r").ns(SM_NS).build();
    assert!(fire_received(&node, &stream, r).await);

    let a = stream
        .sent()
        .into_iter()
        .find(|el| el.name() == "a")
        .expect("ack reply");
    assert_eq!(a.attribute("h"), Some("1"));
    queue.cancel_timers();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_overflow_disconnects_with_policy_violation() {
    // Scenario: max_queue_size=1, two unacked outbound messages.
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1).await;

    let stream = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(stream.clone());
    enable_sm(&node, &stream).await;

    fire_sent(&node, &stream, message("m1")).await;
    assert!(stream.disconnects().is_empty());

    fire_sent(&node, &stream, message("m2")).await;
    assert_eq!(
        stream.disconnects(),
        vec![StreamErrorCondition::PolicyViolation]
    );
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ack_beyond_out_h_disconnects() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let stream = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(stream.clone());
    enable_sm(&node, &stream).await;

    fire_sent(&node, &stream, message("m1")).await;
    let ack = Element::builder("a").ns(SM_NS).attr("h", "9").build();
    assert!(fire_received(&node, &stream, ack).await);
    assert_eq!(
        stream.disconnects(),
        vec![StreamErrorCondition::PolicyViolation]
    );
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_resume_replays_pending_in_order() {
    // Scenario: disconnect an enabled stream mid-session, deliver two
    // messages, reconnect, resume; both replay in order with original
    // ids.
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let old = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(old.clone());
    let smid = enable_sm(&node, &old).await;

    // Transport drops: hibernate.
    old.set_hibernated(true);
    let mut ctx = ExecutionContext::with_stream(
        HookInfo::C2SStream(C2SStreamInfo {
            id: old.id(),
            jid: old.jid(),
            element: None,
        }),
        old.clone(),
    );
    node.hooks()
        .run(HookKind::C2SStreamHibernated, &mut ctx)
        .await
        .unwrap();

    // Deliveries while hibernated land in the queue.
    for n in 1..=2 {
        let stanza = chorus::xmpp::Stanza::try_from(message(&format!("m{n}"))).unwrap();
        node.local_router().deliver(stanza).await.unwrap();
    }
    assert_eq!(node.queues().get("alice/yard").unwrap().len(), 2);
    assert!(old.sent().is_empty());

    // Fresh, authenticated, not-yet-bound stream resumes.
    let new = MockStream::new(2);
    let resume = Element::builder("resume")
        .ns(SM_NS)
        .attr("previd", &smid)
        .attr("h", "0")
        .build();
    assert!(fire_received(&node, &new, resume).await);

    let sent = new.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].name(), "resumed");
    assert_eq!(sent[0].attribute("previd"), Some(smid.as_str()));
    assert_eq!(sent[1].attribute("id"), Some("m1"));
    assert_eq!(sent[2].attribute("id"), Some("m2"));

    // The new stream adopted the identity and the queue survived.
    assert_eq!(new.jid().unwrap().to_string(), "alice@chorus.im/yard");
    assert!(new.info().bool_value(INFO_SM_ENABLED));
    let queue = node.queues().get("alice/yard").expect("queue re-attached");
    assert_eq!(queue.len(), 2); // replayed but not yet acked
    queue.cancel_timers();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_trims_acknowledged_prefix() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let old = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(old.clone());
    let smid = enable_sm(&node, &old).await;

    for n in 1..=3 {
        fire_sent(&node, &old, message(&format!("m{n}"))).await;
    }
    old.set_hibernated(true);

    // Client had already seen the first two.
    let new = MockStream::new(2);
    let resume = Element::builder("resume")
        .ns(SM_NS)
        .attr("previd", &smid)
        .attr("h", "2")
        .build();
    assert!(fire_received(&node, &new, resume).await);

    let sent = new.sent();
    assert_eq!(sent[0].name(), "resumed");
    assert_eq!(sent.len(), 2); // <resumed/> plus the single pending element
    assert_eq!(sent[1].attribute("id"), Some("m3"));

    node.queues().get("alice/yard").unwrap().cancel_timers();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_with_h_beyond_out_h_is_policy_violation() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let old = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(old.clone());
    let smid = enable_sm(&node, &old).await;
    old.set_hibernated(true);

    let new = MockStream::new(2);
    let resume = Element::builder("resume")
        .ns(SM_NS)
        .attr("previd", &smid)
        .attr("h", "7")
        .build();
    assert!(fire_received(&node, &new, resume).await);
    assert_eq!(
        new.disconnects(),
        vec![StreamErrorCondition::PolicyViolation]
    );
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_unknown_smid_is_item_not_found() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let new = MockStream::new(1);
    let resume = Element::builder("resume")
        .ns(SM_NS)
        .attr("previd", "garbage-not-base64!!")
        .attr("h", "0")
        .build();
    assert!(fire_received(&node, &new, resume).await);

    let failed = new
        .sent()
        .into_iter()
        .find(|el| el.name() == "failed")
        .expect("failed reply");
    assert!(failed.child("item-not-found").is_some());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_expired_queue_is_item_not_found() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let old = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(old.clone());
    let smid = enable_sm(&node, &old).await;

    // Queue garbage-collected (hibernation window elapsed).
    node.queues().detach("alice/yard").unwrap().cancel_timers();
    node.local_router().unregister(&(old.clone() as Arc<dyn C2sStream>));

    let new = MockStream::new(2);
    let resume = Element::builder("resume")
        .ns(SM_NS)
        .attr("previd", &smid)
        .attr("h", "0")
        .build();
    assert!(fire_received(&node, &new, resume).await);

    let failed = new
        .sent()
        .into_iter()
        .find(|el| el.name() == "failed")
        .expect("failed reply");
    assert!(failed.child("item-not-found").is_some());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hibernated_stream_keeps_resource_record() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let stream = MockStream::bound(1, "alice@chorus.im/yard");
    node.local_router().register(stream.clone());
    node.directory()
        .put(ResourceDesc {
            instance_id: node.instance_id().to_owned(),
            jid: "alice@chorus.im/yard".parse().unwrap(),
            presence: None,
            info: stream.info(),
        })
        .await
        .unwrap();
    enable_sm(&node, &stream).await;

    stream.set_hibernated(true);
    let mut ctx = ExecutionContext::with_stream(
        HookInfo::C2SStream(C2SStreamInfo {
            id: stream.id(),
            jid: stream.jid(),
            element: None,
        }),
        stream.clone(),
    );
    node.hooks()
        .run(HookKind::C2SStreamHibernated, &mut ctx)
        .await
        .unwrap();

    // Hibernation retains both the record and the queue.
    assert!(node.directory().get("alice", "yard").await.unwrap().is_some());
    let queue = node.queues().get("alice/yard").expect("queue retained");
    queue.cancel_timers();
    node.shutdown().await.unwrap();
}
