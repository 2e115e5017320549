//! Two-node flows over the shared bus and presence registry.
mod common;

use bytes::Bytes;
use chatd::store::DirectoryStore;
use chatd::{AppContext, Services};
use common::{TestCluster, register_and_login};
use parley_bus::{CrossNodeEnvelope, EnvelopeKind, MessageBus, subjects};
use parley_client::ChatClient;
use parley_presence::{Location, PresenceRegistry};
use parley_proto::{GroupTextMsgPush, TextMsg, group_status, msg_id};
use parley_storage::{KvCache, MessageStore};
use std::sync::Arc;
use std::time::Duration;

const PUSH_WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cross_node_p2p_publishes_instead_of_queuing() {
    let cluster = TestCluster::new();
    let n1 = cluster.spawn_node("n1").await;
    let n2 = cluster.spawn_node("n2").await;

    let alice = ChatClient::connect(n1.addr()).await.expect("alice");
    let bob = ChatClient::connect(n2.addr()).await.expect("bob");
    let alice_id = register_and_login(&alice, "alice", "123456", "alice@x").await;
    let bob_id = register_and_login(&bob, "bob", "123456", "bob@x").await;

    // Presence agrees bob lives on n2.
    assert_eq!(
        cluster
            .presence
            .get_server(&bob_id.user_uuid)
            .await
            .expect("presence"),
        Location::Node("n2".to_string())
    );

    alice.send_text("bob", "x").await.expect("send");

    let push = bob.next_push(PUSH_WAIT).await.expect("bob push");
    assert_eq!(push.msg_id, msg_id::TEXT_MSG);
    let msg: TextMsg = serde_json::from_slice(&push.payload).expect("decode");
    assert_eq!(msg.content, "x");
    assert_eq!(msg.from_user_id.as_deref(), Some(alice_id.user_uuid.as_str()));

    // The sending node wrote history; nobody queued offline.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!cluster.messages.has_offline(bob_id.id).await.expect("has"));
    let history = cluster
        .messages
        .history(alice_id.id, bob_id.id, 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);

    alice.close().await;
    bob.close().await;
    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn subscriber_miss_parks_the_payload_offline() {
    // A node that holds the subscription but has lost the session parks
    // the payload in the offline queue; the sender already wrote history.
    let cluster = TestCluster::new();

    let carol = cluster
        .directory
        .create_user("carol", "hash", "carol@x")
        .await
        .expect("create carol");

    // n2's coordinator believes carol is online, but no session exists in
    // its registry.
    let services = Arc::new(Services::new(
        cluster.node_config("n2"),
        Arc::clone(&cluster.directory) as Arc<dyn DirectoryStore>,
        Arc::clone(&cluster.messages) as Arc<dyn MessageStore>,
        Arc::clone(&cluster.cache) as Arc<dyn KvCache>,
        Arc::clone(&cluster.presence) as Arc<dyn PresenceRegistry>,
        Arc::clone(&cluster.bus) as Arc<dyn MessageBus>,
    ));
    let ctx = AppContext::new(Arc::clone(&services));
    ctx.coordinator
        .handle_user_online(carol.id, &carol.user_uuid)
        .await
        .expect("online");

    let payload = TextMsg {
        from_user_id: Some("some-remote-uuid".to_string()),
        to_user_id: carol.user_uuid.clone(),
        content: "moved?".to_string(),
        msg_type: None,
        sent_at: Some(1),
    };
    let envelope = CrossNodeEnvelope::new(
        EnvelopeKind::P2p,
        &carol.user_uuid,
        "n1",
        Bytes::from(serde_json::to_vec(&payload).expect("encode")),
    );
    cluster
        .bus
        .publish(&subjects::p2p(&carol.user_uuid), envelope.encode())
        .await
        .expect("publish");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(cluster.messages.has_offline(carol.id).await.expect("has"));
    // No history write on the subscriber side.
    let drained = cluster.messages.drain_offline(carol.id).await.expect("drain");
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].data, envelope.payload);
}

#[tokio::test]
async fn group_fan_out_reaches_members_on_both_nodes() {
    let cluster = TestCluster::new();
    let n1 = cluster.spawn_node("n1").await;
    let n2 = cluster.spawn_node("n2").await;

    let alice = ChatClient::connect(n1.addr()).await.expect("alice");
    let bob = ChatClient::connect(n1.addr()).await.expect("bob");
    let carol = ChatClient::connect(n2.addr()).await.expect("carol");
    let alice_id = register_and_login(&alice, "alice", "123456", "alice@x").await;
    register_and_login(&bob, "bob", "123456", "bob@x").await;
    register_and_login(&carol, "carol", "123456", "carol@x").await;

    let group = alice.create_group("G", "", "").await.expect("create");
    bob.join_group(group.id).await.expect("bob joins");
    carol.join_group(group.id).await.expect("carol joins");

    let resp = alice
        .send_group_text(group.id, "hello G")
        .await
        .expect("group send");
    assert_eq!(resp.status, group_status::OK);
    let stored_id = resp.msg_id.expect("msg id");
    assert!(!stored_id.is_empty());

    // bob locally on n1, carol via the bus on n2.
    let bob_push = bob.next_push(PUSH_WAIT).await.expect("bob push");
    assert_eq!(bob_push.msg_id, msg_id::GROUP_TEXT_MSG_PUSH);
    let carol_push = carol.next_push(PUSH_WAIT).await.expect("carol push");
    assert_eq!(carol_push.msg_id, msg_id::GROUP_TEXT_MSG_PUSH);
    let body: GroupTextMsgPush = serde_json::from_slice(&carol_push.payload).expect("decode");
    assert_eq!(body.content, "hello G");
    assert_eq!(body.from_user_id, alice_id.id);

    // The sender never hears an echo, even across the bus.
    assert!(alice.next_push(Duration::from_millis(400)).await.is_err());

    // One persisted record with the acked id.
    let history = cluster
        .directory
        .group_history(group.id, 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].msg_id, stored_id);
    assert_eq!(history[0].sender_id, alice_id.id);

    alice.close().await;
    bob.close().await;
    carol.close().await;
    n1.shutdown().await;
    n2.shutdown().await;
}

#[tokio::test]
async fn recipient_offline_everywhere_queues_offline_from_the_sender_node() {
    let cluster = TestCluster::new();
    let n1 = cluster.spawn_node("n1").await;
    let n2 = cluster.spawn_node("n2").await;

    let alice = ChatClient::connect(n1.addr()).await.expect("alice");
    register_and_login(&alice, "alice", "123456", "alice@x").await;

    // bob logs in on n2, then logs out cleanly.
    let bob = ChatClient::connect(n2.addr()).await.expect("bob");
    let bob_id = register_and_login(&bob, "bob", "123456", "bob@x").await;
    bob.logout().await.expect("logout");
    bob.close().await;

    // Presence is gone, so the sender's node takes the offline path.
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.send_text("bob", "see you").await.expect("send");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(cluster.messages.has_offline(bob_id.id).await.expect("has"));

    alice.close().await;
    n1.shutdown().await;
    n2.shutdown().await;
}
