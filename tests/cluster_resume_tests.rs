//! Cross-node session continuity: queue hand-off over the cluster RPC
//! surface, remote stanza forwarding and concurrent resume tie-breaks.

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

async fn start_node(kv: Arc<dyn KV>, id: &str) -> Node {
    let mut config = Config::default();
    config.hosts = vec!["chorus.im".into()];
    config.cluster.bind_addr = "127.0.0.1:0".into();
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

fn message(id: &str, to: &str) -> Element {
    Element::builder("message")
        .attr("to", to)
        .attr("from", "noelia@chorus.im/yard")
        .attr("id", id)
        .child(Element::builder("body").text("hello").build())
        .build()
}

fn resume_el(smid: &str, h: u32) -> Element {
    Element::builder("resume")
        .ns(SM_NS)
        .attr("previd", smid)
        .attr("h", h.to_string())
        .build()
}

/// Bind a mock on the node, publish its descriptor, enable SM and
/// hibernate it. Returns (stream, smid).
async fn hibernated_session(node: &Node, jid: &str) -> (Arc<MockStream>, String) {
    let stream = MockStream::bound(1, jid);
    node.local_router().register(stream.clone());
    node.directory()
        .put(ResourceDesc {
            instance_id: node.instance_id().to_owned(),
            jid: jid.parse().unwrap(),
            presence: None,
            info: stream.info(),
        })
        .await
        .unwrap();

    let enable = Element::builder("enable").ns(SM_NS).attr("resume", "true").build();
    assert!(fire_received(node, &stream, enable).await);
    let smid = stream
        .sent()
        .into_iter()
        .find(|el| el.name() == "enabled")
        .and_then(|el| el.attribute("id").map(str::to_owned))
        .expect("smid");
    stream.clear_sent();
    stream.set_hibernated(true);
    (stream, smid)
}

#[tokio::test]
async fn test_cross_node_resume_transfers_queue() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node_a = start_node(kv.clone(), "node-a").await;
    let node_b = start_node(kv.clone(), "node-b").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (old, smid) = hibernated_session(&node_a, "alice@chorus.im/yard").await;

    // Two deliveries land in A's hibernating queue.
    for n in 1..=2 {
        let stanza = chorus::xmpp::Stanza::try_from(message(
            &format!("m{n}"),
            "alice@chorus.im/yard",
        ))
        .unwrap();
        node_a.local_router().deliver(stanza).await.unwrap();
    }
    assert_eq!(node_a.queues().get("alice/yard").unwrap().len(), 2);

    // Client reconnects against B and resumes.
    let new = MockStream::new(2);
    assert!(fire_received(&node_b, &new, resume_el(&smid, 0)).await);

    let sent = new.sent();
    assert_eq!(sent.len(), 3, "resumed + 2 replayed, got {sent:?}");
    assert_eq!(sent[0].name(), "resumed");
    assert_eq!(sent[1].attribute("id"), Some("m1"));
    assert_eq!(sent[2].attribute("id"), Some("m2"));
    assert!(new.info().bool_value(INFO_SM_ENABLED));

    // The queue moved: A no longer owns it, B does.
    assert!(node_a.queues().get("alice/yard").is_none());
    let queue = node_b.queues().get("alice/yard").expect("queue installed on B");
    assert_eq!(queue.len(), 2);

    // A's stale hibernated stream was conflicted out.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(old.disconnects(), vec![StreamErrorCondition::Conflict]);

    queue.cancel_timers();
    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_with_unreachable_owner_is_item_not_found() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node_b = start_node(kv.clone(), "node-b").await;

    // A descriptor points at an instance that is not in the member
    // directory (crashed before its lease expired from the cache).
    node_b
        .directory()
        .put(ResourceDesc {
            instance_id: "node-ghost".into(),
            jid: "alice@chorus.im/yard".parse().unwrap(),
            presence: None,
            info: Default::default(),
        })
        .await
        .unwrap();

    let smid = chorus::sm::encode_smid(
        &"alice@chorus.im/yard".parse().unwrap(),
        &[9u8; 24],
    );
    let new = MockStream::new(1);
    assert!(fire_received(&node_b, &new, resume_el(&smid, 0)).await);

    let failed = new
        .sent()
        .into_iter()
        .find(|el| el.name() == "failed")
        .expect("failed reply");
    assert!(failed.child("item-not-found").is_some());
    node_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_resumes_exactly_one_wins() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node_a = start_node(kv.clone(), "node-a").await;
    let node_b = start_node(kv.clone(), "node-b").await;
    let node_c = start_node(kv.clone(), "node-c").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (_old, smid) = hibernated_session(&node_a, "alice@chorus.im/yard").await;

    let new_b = MockStream::new(2);
    let new_c = MockStream::new(3);
    let (halted_b, halted_c) = tokio::join!(
        fire_received(&node_b, &new_b, resume_el(&smid, 0)),
        fire_received(&node_c, &new_c, resume_el(&smid, 0)),
    );
    assert!(halted_b && halted_c);

    let resumed = |s: &Arc<MockStream>| s.sent().iter().any(|el| el.name() == "resumed");
    let failed = |s: &Arc<MockStream>| {
        s.sent()
            .iter()
            .any(|el| el.name() == "failed" && el.child("item-not-found").is_some())
    };

    let winners = [&new_b, &new_c].iter().filter(|s| resumed(s)).count();
    let losers = [&new_b, &new_c].iter().filter(|s| failed(s)).count();
    assert_eq!(winners, 1, "exactly one resume must succeed");
    assert_eq!(losers, 1, "the other must observe item-not-found");

    // The detach happened exactly once on A.
    assert!(node_a.queues().get("alice/yard").is_none());

    for node in [&node_b, &node_c] {
        if let Some(queue) = node.queues().get("alice/yard") {
            queue.cancel_timers();
        }
    }
    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
    node_c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_forwarding_after_resume_targets_new_node() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node_a = start_node(kv.clone(), "node-a").await;
    let node_b = start_node(kv.clone(), "node-b").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (_old, smid) = hibernated_session(&node_a, "alice@chorus.im/yard").await;

    let new = MockStream::new(2);
    assert!(fire_received(&node_b, &new, resume_el(&smid, 0)).await);
    assert!(new.sent().iter().any(|el| el.name() == "resumed"));
    new.clear_sent();

    // A real session handle republishes its descriptor and router
    // entry on resume; the mock records the call only, so emulate both.
    node_b.local_router().register(new.clone());
    node_b
        .directory()
        .put(ResourceDesc {
            instance_id: node_b.instance_id().to_owned(),
            jid: "alice@chorus.im/yard".parse().unwrap(),
            presence: None,
            info: new.info(),
        })
        .await
        .unwrap();
    // Wait for A's directory watch to observe the move.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let stanza =
        chorus::xmpp::Stanza::try_from(message("m9", "alice@chorus.im/yard")).unwrap();
    node_a.router().route(stanza).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(new.sent().iter().any(|el| el.attribute("id") == Some("m9")));

    if let Some(queue) = node_b.queues().get("alice/yard") {
        queue.cancel_timers();
    }
    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}
