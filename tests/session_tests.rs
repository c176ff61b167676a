//! End-to-end C2S session tests: negotiation, binding, stanza
//! exchange, hibernation on transport loss and resumption, driven over
//! in-memory transports against a full node.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use chorus::cluster::directory::ResourceDesc;
use chorus::cluster::kv::KV;
use chorus::cluster::kv::memory::MemoryKv;
use chorus::config::{C2sConfig, Config};
use chorus::node::Node;
use chorus::router::stream::C2sStream;
use chorus::router::test_support::MockStream;
use chorus::server::sasl::StaticAuthenticator;
use chorus::server::session::{C2sSession, C2sSessionHandle};
use chorus::server::transport::{MemoryTransport, MemoryTransportHandle};
use chorus::xmpp::{Element, StreamEvent};

const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const SM_NS: &str = "urn:xmpp:sm:3";

async fn start_node(kv: Arc<dyn KV>, id: &str, max_queue_size: usize) -> Node {
    let mut config = Config::default();
    config.hosts = vec!["chorus.im".into()];
    config.cluster.bind_addr = "127.0.0.1:0".into();
    config.sm.max_queue_size = max_queue_size;
    let authenticator = Arc::new(StaticAuthenticator::new());
    authenticator.add_user("alice", "xyzzy").await;
    authenticator.add_user("bob", "hunter2").await;
    Node::start_with_instance_id(config, kv, authenticator, None, Some(id.into()))
        .await
        .unwrap()
}

fn spawn_session(
    node: &Node,
) -> (
    MemoryTransportHandle,
    Arc<C2sSessionHandle>,
    tokio::task::JoinHandle<()>,
) {
    let (transport, handle) = MemoryTransport::pair();
    let session = C2sSession::new(Box::new(transport), C2sConfig::default(), node.session_deps());
    let session_handle = session.handle();
    let task = tokio::spawn(session.run());
    (handle, session_handle, task)
}

async fn next_written(handle: &mut MemoryTransportHandle) -> Element {
    tokio::time::timeout(Duration::from_secs(1), handle.written())
        .await
        .expect("timed out waiting for a written element")
        .expect("session closed its write side")
}

fn stream_open() -> StreamEvent {
    let mut attrs = BTreeMap::new();
    attrs.insert("to".to_owned(), "chorus.im".to_owned());
    StreamEvent::StreamOpen { attrs }
}

fn auth_el(user: &str, password: &str) -> Element {
    Element::builder("auth")
        .ns(SASL_NS)
        .attr("mechanism", "SCRAM-SHA-256")
        .text(BASE64.encode(format!("\0{user}\0{password}")))
        .build()
}

fn bind_el(resource: &str) -> Element {
    Element::builder("iq")
        .attr("type", "set")
        .attr("id", "b1")
        .child(
            Element::builder("bind")
                .ns(BIND_NS)
                .child(Element::builder("resource").text(resource).build())
                .build(),
        )
        .build()
}

/// Drive a fresh session through open → SASL → restart → bind.
async fn bind_session(
    node: &Node,
    user: &str,
    password: &str,
    resource: &str,
) -> (
    MemoryTransportHandle,
    Arc<C2sSessionHandle>,
    tokio::task::JoinHandle<()>,
) {
    let (mut handle, session_handle, task) = spawn_session(node);

    handle.push(stream_open());
    let features = next_written(&mut handle).await;
    assert_eq!(features.name(), "stream:features");
    assert!(features.child("mechanisms").is_some());

    handle.push_element(auth_el(user, password));
    let success = next_written(&mut handle).await;
    assert_eq!(success.name(), "success");

    handle.push(stream_open());
    let features = next_written(&mut handle).await;
    assert!(features.child("bind").is_some());
    assert!(features.child("sm").is_some());

    handle.push_element(bind_el(resource));
    let result = next_written(&mut handle).await;
    assert_eq!(result.name(), "iq");
    assert_eq!(result.attribute("type"), Some("result"));

    (handle, session_handle, task)
}

/// Enable stream management on a bound session; returns the SMID.
async fn enable_sm(handle: &mut MemoryTransportHandle) -> String {
    handle.push_element(
        Element::builder("enable")
            .ns(SM_NS)
            .attr("resume", "true")
            .build(),
    );
    let enabled = next_written(handle).await;
    assert_eq!(enabled.name(), "enabled");
    assert_eq!(enabled.attribute("resume"), Some("true"));
    enabled.attribute("id").expect("smid").to_owned()
}

#[tokio::test]
async fn test_negotiation_and_bind_publishes_resource() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let (_handle, session_handle, _task) = bind_session(&node, "alice", "xyzzy", "desk").await;

    assert!(session_handle.is_bound());
    assert_eq!(
        session_handle.jid().unwrap().to_string(),
        "alice@chorus.im/desk"
    );
    let desc = node.directory().get("alice", "desk").await.unwrap().unwrap();
    assert_eq!(desc.instance_id, node.instance_id());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_credentials_are_rejected() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let (mut handle, session_handle, _task) = spawn_session(&node);
    handle.push(stream_open());
    let _features = next_written(&mut handle).await;

    handle.push_element(auth_el("alice", "wrong"));
    let failure = next_written(&mut handle).await;
    assert_eq!(failure.name(), "failure");
    assert!(failure.child("not-authorized").is_some());
    assert!(!session_handle.is_bound());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bound_stanza_is_routed_with_sender_addressing() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    // A peer to deliver to.
    let bob = MockStream::bound(99, "bob@chorus.im/desk");
    node.local_router().register(bob.clone());
    node.directory()
        .put(ResourceDesc {
            instance_id: node.instance_id().to_owned(),
            jid: "bob@chorus.im/desk".parse().unwrap(),
            presence: None,
            info: bob.info(),
        })
        .await
        .unwrap();

    let (mut handle, _session_handle, _task) = bind_session(&node, "alice", "xyzzy", "desk").await;

    handle.push_element(
        Element::builder("message")
            .attr("to", "bob@chorus.im/desk")
            .attr("id", "m1")
            .child(Element::builder("body").text("hi").build())
            .build(),
    );

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if !bob.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message never delivered");

    let delivered = &bob.sent()[0];
    assert_eq!(delivered.attribute("id"), Some("m1"));
    // The server stamps the sender's full JID.
    assert_eq!(delivered.attribute("from"), Some("alice@chorus.im/desk"));
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_plain_teardown_removes_resource_record() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let (mut handle, session_handle, task) = bind_session(&node, "alice", "xyzzy", "desk").await;

    // No stream management: transport loss is a full teardown.
    handle.drop_connection();
    task.await.unwrap();

    assert!(!session_handle.is_bound());
    assert!(node.directory().get("alice", "desk").await.unwrap().is_none());
    assert!(node.local_router().get("alice", "desk").is_none());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transport_loss_hibernates_enabled_stream() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let (mut handle, session_handle, task) = bind_session(&node, "alice", "xyzzy", "desk").await;
    let _smid = enable_sm(&mut handle).await;

    handle.drop_connection();
    task.await.unwrap();

    assert!(session_handle.is_hibernated());
    // Record and queue both survive hibernation.
    assert!(node.directory().get("alice", "desk").await.unwrap().is_some());
    assert!(node.queues().get("alice/desk").is_some());
    assert!(node.local_router().get("alice", "desk").is_some());

    node.queues().get("alice/desk").unwrap().cancel_timers();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_full_resume_cycle_over_sessions() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    // First connection: bind, enable, lose transport.
    let (mut handle, _session_handle, task) = bind_session(&node, "alice", "xyzzy", "desk").await;
    let smid = enable_sm(&mut handle).await;
    handle.drop_connection();
    task.await.unwrap();

    // Two deliveries while hibernated.
    for n in 1..=2 {
        let stanza = chorus::xmpp::Stanza::try_from(
            Element::builder("message")
                .attr("to", "alice@chorus.im/desk")
                .attr("from", "bob@chorus.im/desk")
                .attr("id", format!("m{n}"))
                .build(),
        )
        .unwrap();
        node.router().route(stanza).await.unwrap();
    }
    assert_eq!(node.queues().get("alice/desk").unwrap().len(), 2);

    // Second connection: authenticate, then resume instead of binding.
    let (mut handle2, session_handle2, _task2) = spawn_session(&node);
    handle2.push(stream_open());
    let _ = next_written(&mut handle2).await;
    handle2.push_element(auth_el("alice", "xyzzy"));
    let success = next_written(&mut handle2).await;
    assert_eq!(success.name(), "success");
    handle2.push(stream_open());
    let _ = next_written(&mut handle2).await;

    handle2.push_element(
        Element::builder("resume")
            .ns(SM_NS)
            .attr("previd", &smid)
            .attr("h", "0")
            .build(),
    );

    let resumed = next_written(&mut handle2).await;
    assert_eq!(resumed.name(), "resumed");
    assert_eq!(resumed.attribute("previd"), Some(smid.as_str()));

    // Replay precedes new traffic, in order, original ids intact.
    let replay1 = next_written(&mut handle2).await;
    let replay2 = next_written(&mut handle2).await;
    assert_eq!(replay1.attribute("id"), Some("m1"));
    assert_eq!(replay2.attribute("id"), Some("m2"));

    assert!(session_handle2.is_bound());
    assert_eq!(
        session_handle2.jid().unwrap().to_string(),
        "alice@chorus.im/desk"
    );
    let desc = node.directory().get("alice", "desk").await.unwrap().unwrap();
    assert_eq!(desc.instance_id, node.instance_id());

    node.queues().get("alice/desk").unwrap().cancel_timers();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_overflow_tears_the_stream_down() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1).await;

    let (mut handle, _session_handle, task) = bind_session(&node, "alice", "xyzzy", "desk").await;
    enable_sm(&mut handle).await;

    for n in 1..=2 {
        let stanza = chorus::xmpp::Stanza::try_from(
            Element::builder("message")
                .attr("to", "alice@chorus.im/desk")
                .attr("from", "bob@chorus.im/desk")
                .attr("id", format!("m{n}"))
                .build(),
        )
        .unwrap();
        node.router().route(stanza).await.unwrap();
    }

    // The second unacked element exceeds the bound: stream error then
    // teardown, including the resource record.
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Some(el) = handle.try_written() {
                if el.name() == "stream:error" && el.child("policy-violation").is_some() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("expected a policy-violation stream error");

    task.await.unwrap();
    assert!(node.directory().get("alice", "desk").await.unwrap().is_none());
    assert!(node.queues().get("alice/desk").is_none());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_stanza_is_policy_violation() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let (transport, mut handle) = MemoryTransport::pair();
    let cfg = C2sConfig {
        max_stanza_size: 64,
        ..Default::default()
    };
    let session = C2sSession::new(Box::new(transport), cfg, node.session_deps());
    let task = tokio::spawn(session.run());

    handle.push(stream_open());
    let _ = next_written(&mut handle).await;
    handle.push_element(
        Element::builder("auth")
            .ns(SASL_NS)
            .attr("mechanism", "SCRAM-SHA-256")
            .text(BASE64.encode("x".repeat(200)))
            .build(),
    );

    let error = next_written(&mut handle).await;
    assert_eq!(error.name(), "stream:error");
    assert!(error.child("policy-violation").is_some());
    task.await.unwrap();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_bind_conflicts_the_old_stream() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let (_h1, old_handle, old_task) = bind_session(&node, "alice", "xyzzy", "desk").await;
    let (_h2, new_handle, _t2) = bind_session(&node, "alice", "xyzzy", "desk").await;

    // The newcomer owns the binding; the old stream is closed.
    tokio::time::timeout(Duration::from_secs(1), old_task)
        .await
        .expect("old session should terminate")
        .unwrap();
    assert!(!old_handle.is_bound());
    assert!(new_handle.is_bound());
    assert_eq!(
        node.local_router().get("alice", "desk").unwrap().id(),
        new_handle.id()
    );
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_generated_resource_when_client_omits_it() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let (mut handle, session_handle, _task) = spawn_session(&node);
    handle.push(stream_open());
    let _ = next_written(&mut handle).await;
    handle.push_element(auth_el("bob", "hunter2"));
    let _ = next_written(&mut handle).await;
    handle.push(stream_open());
    let _ = next_written(&mut handle).await;

    handle.push_element(
        Element::builder("iq")
            .attr("type", "set")
            .attr("id", "b1")
            .child(Element::builder("bind").ns(BIND_NS).build())
            .build(),
    );
    let result = next_written(&mut handle).await;
    assert_eq!(result.attribute("type"), Some("result"));

    let jid = session_handle.jid().expect("bound jid");
    assert_eq!(jid.node(), Some("bob"));
    assert!(!jid.resource().unwrap().is_empty());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stream_to_unserved_host_is_rejected() {
    let kv: Arc<dyn KV> = Arc::new(MemoryKv::new());
    let node = start_node(kv, "node-a", 1000).await;

    let (mut handle, _session_handle, task) = spawn_session(&node);
    let mut attrs = BTreeMap::new();
    attrs.insert("to".to_owned(), "intruder.example".to_owned());
    handle.push(StreamEvent::StreamOpen { attrs });

    let error = next_written(&mut handle).await;
    assert_eq!(error.name(), "stream:error");
    assert!(error.child("host-unknown").is_some());
    task.await.unwrap();
    node.shutdown().await.unwrap();
}
