//! Single-node end-to-end flows: online delivery, offline queue and drain,
//! displacement, error responses, and the query endpoints.
mod common;

use common::{TestCluster, register_and_login};
use parley_client::ChatClient;
use parley_proto::{ErrorResp, TextMsg, code, msg_id};
use parley_storage::MessageStore as _;
use std::time::Duration;

const PUSH_WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn online_p2p_same_node_delivers_once_and_writes_history_only() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("alice connect");
    let bob = ChatClient::connect(node.addr()).await.expect("bob connect");
    let alice_id = register_and_login(&alice, "alice", "123456", "alice@x").await;
    let bob_id = register_and_login(&bob, "bob", "123456", "bob@x").await;

    alice.send_text("bob", "hi").await.expect("send");

    let push = bob.next_push(PUSH_WAIT).await.expect("bob push");
    assert_eq!(push.msg_id, msg_id::TEXT_MSG);
    let msg: TextMsg = serde_json::from_slice(&push.payload).expect("decode");
    assert_eq!(msg.content, "hi");
    assert_eq!(msg.from_user_id.as_deref(), Some(alice_id.user_uuid.as_str()));

    // History exactly once, offline not at all.
    let history = cluster
        .messages
        .history(alice_id.id, bob_id.id, 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert!(!cluster.messages.has_offline(bob_id.id).await.expect("has"));

    // Both clients see the same history over the wire.
    let records = alice.history(&bob_id.user_uuid, 10).await.expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, "hi");
    assert_eq!(records[0].from_user_id, alice_id.id.to_string());

    // Relations recorded for both ends.
    assert_eq!(alice.relations().await.expect("relations"), vec![bob_id.id]);
    assert_eq!(bob.relations().await.expect("relations"), vec![alice_id.id]);

    alice.close().await;
    bob.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn offline_p2p_queues_then_drains_exactly_once_on_login() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("alice connect");
    let alice_id = register_and_login(&alice, "alice", "123456", "alice@x").await;

    // bob exists but has never connected.
    let registrar = ChatClient::connect(node.addr()).await.expect("registrar");
    let bob_data = registrar
        .register("bob", "123456", "bob@x")
        .await
        .expect("register bob");
    registrar.close().await;

    alice.send_text("bob", "later").await.expect("send");

    // Give the routing engine a moment to persist.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.messages.has_offline(bob_data.id).await.expect("has"));
    let history = cluster
        .messages
        .history(alice_id.id, bob_data.id, 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);

    // bob logs in and receives exactly one replayed frame.
    let bob = ChatClient::connect(node.addr()).await.expect("bob connect");
    bob.login("bob", "123456").await.expect("login");
    let push = bob.next_push(PUSH_WAIT).await.expect("replay");
    assert_eq!(push.msg_id, msg_id::TEXT_MSG);
    let msg: TextMsg = serde_json::from_slice(&push.payload).expect("decode");
    assert_eq!(msg.content, "later");

    assert!(!cluster.messages.has_offline(bob_data.id).await.expect("has"));
    assert!(bob.next_push(Duration::from_millis(300)).await.is_err());

    alice.close().await;
    bob.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn newest_login_displaces_the_older_session() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let first = ChatClient::connect(node.addr()).await.expect("first connect");
    register_and_login(&first, "alice", "123456", "alice@x").await;

    let second = ChatClient::connect(node.addr()).await.expect("second connect");
    second.login("alice", "123456").await.expect("relogin");

    // The old connection hears why before the socket drops.
    let notice = first.next_push(PUSH_WAIT).await.expect("displacement notice");
    assert_eq!(notice.msg_id, msg_id::ERROR_RESP);
    let body: ErrorResp = serde_json::from_slice(&notice.payload).expect("decode");
    assert_eq!(body.code, code::UNAUTHENTICATED);

    // Traffic for alice reaches only the new session.
    let carol = ChatClient::connect(node.addr()).await.expect("carol connect");
    register_and_login(&carol, "carol", "123456", "carol@x").await;
    carol.send_text("alice", "ping").await.expect("send");

    let push = second.next_push(PUSH_WAIT).await.expect("second push");
    assert_eq!(push.msg_id, msg_id::TEXT_MSG);
    // The displaced socket is closed; nothing further arrives on it.
    assert!(first.next_push(Duration::from_millis(500)).await.is_err());

    second.close().await;
    carol.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn unknown_recipient_is_rejected_not_queued() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("connect");
    register_and_login(&alice, "alice", "123456", "alice@x").await;

    alice.send_text("nobody-here", "hello?").await.expect("send");
    let push = alice.next_push(PUSH_WAIT).await.expect("error push");
    assert_eq!(push.msg_id, msg_id::ERROR_RESP);
    let body: ErrorResp = serde_json::from_slice(&push.payload).expect("decode");
    assert_eq!(body.code, code::RECIPIENT_UNKNOWN);

    alice.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn unauthenticated_requests_hit_the_gate() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let client = ChatClient::connect(node.addr()).await.expect("connect");
    client.send_text("anyone", "hi").await.expect("send");
    let push = client.next_push(PUSH_WAIT).await.expect("gate error");
    assert_eq!(push.msg_id, msg_id::ERROR_RESP);
    let body: ErrorResp = serde_json::from_slice(&push.payload).expect("decode");
    assert_eq!(body.code, code::UNAUTHENTICATED);

    // Gated request/response endpoints answer on their own response id.
    let err = client.relations().await.expect_err("gated");
    assert!(err.to_string().contains("chat relations failed"));

    client.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn login_failures_collapse_to_invalid_credentials() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let client = ChatClient::connect(node.addr()).await.expect("connect");
    client
        .register("alice", "123456", "alice@x")
        .await
        .expect("register");

    let unknown_user = client
        .login("nosuchuser", "123456")
        .await
        .expect_err("unknown user");
    let wrong_password = client
        .login("alice", "654321")
        .await
        .expect_err("wrong password");
    // Same wire shape for both: the specific cause stays server-side.
    assert_eq!(unknown_user.to_string(), wrong_password.to_string());
    assert!(unknown_user.to_string().contains("invalid credentials"));

    let duplicate = client
        .register("alice", "123456", "again@x")
        .await
        .expect_err("duplicate username");
    assert!(duplicate.to_string().contains("username already exists"));

    client.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn login_mints_a_verifiable_token_and_mirrors_it() {
    let cluster = TestCluster::new();
    let config = cluster.node_config("n1");
    let token_config = parley_auth::TokenConfig::new(
        config.auth.jwt_secret.clone(),
        config.auth.jwt_issuer.clone(),
    );
    let node = cluster.spawn_node_with(config).await;

    let alice = ChatClient::connect(node.addr()).await.expect("connect");
    let alice_id = register_and_login(&alice, "alice", "123456", "alice@x").await;
    assert!(!alice_id.token.is_empty());

    // The token verifies under the node's secret and carries the same
    // identity the registration produced.
    let keeper = parley_auth::TokenKeeper::new(&token_config);
    let claims = keeper.verify(&alice_id.token).expect("verify");
    assert_eq!(claims.user_id, alice_id.id);
    assert_eq!(claims.user_uuid, alice_id.user_uuid);
    assert_eq!(claims.username, "alice");

    // And the cache mirrors it under session:<user_id>.
    use parley_storage::KvCache as _;
    let mirrored = cluster
        .cache
        .get(&parley_storage::keys::session(alice_id.id))
        .await
        .expect("cache get")
        .expect("session mirror");
    assert_eq!(mirrored.as_ref(), alice_id.token.as_bytes());

    alice.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn logout_clears_session_and_closes_the_connection() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("connect");
    let alice_id = register_and_login(&alice, "alice", "123456", "alice@x").await;
    alice.logout().await.expect("logout");
    assert!(alice.identity().is_none());

    // The server closed the socket after the response.
    assert!(alice.next_push(Duration::from_millis(500)).await.is_err());

    // Messages to alice now queue offline.
    let bob = ChatClient::connect(node.addr()).await.expect("bob connect");
    register_and_login(&bob, "bob", "123456", "bob@x").await;
    bob.send_text("alice", "gone?").await.expect("send");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.messages.has_offline(alice_id.id).await.expect("has"));

    bob.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn oversized_frames_close_the_connection_with_an_error() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let client = ChatClient::connect(node.addr()).await.expect("connect");
    register_and_login(&client, "alice", "123456", "alice@x").await;

    // Default max packet size is 4096; this frame declares far more.
    let oversized = "x".repeat(8192);
    client
        .send(msg_id::TEXT_MSG, bytes::Bytes::from(oversized))
        .await
        .expect("send");

    let push = client.next_push(PUSH_WAIT).await.expect("error");
    assert_eq!(push.msg_id, msg_id::ERROR_RESP);
    let body: ErrorResp = serde_json::from_slice(&push.payload).expect("decode");
    assert!(body.message.contains("exceeds"));
    // And then the socket goes away.
    assert!(client.next_push(Duration::from_millis(500)).await.is_err());

    node.shutdown().await;
}

#[tokio::test]
async fn history_limit_clamps_to_the_window() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("alice");
    let bob = ChatClient::connect(node.addr()).await.expect("bob");
    register_and_login(&alice, "alice", "123456", "alice@x").await;
    let bob_id = register_and_login(&bob, "bob", "123456", "bob@x").await;

    for i in 0..60 {
        alice
            .send_text("bob", &format!("m{i}"))
            .await
            .expect("send");
    }
    // Drain bob's pushes so nothing backs up.
    for _ in 0..60 {
        bob.next_push(PUSH_WAIT).await.expect("push");
    }

    // limit <= 0 defaults to 50.
    let defaulted = alice.history(&bob_id.user_uuid, 0).await.expect("history");
    assert_eq!(defaulted.len(), 50);
    assert_eq!(defaulted[0].content, "m10");
    // limit > 200 clamps to 200 (only 60 exist).
    let clamped = alice.history(&bob_id.user_uuid, 10_000).await.expect("history");
    assert_eq!(clamped.len(), 60);

    alice.close().await;
    bob.close().await;
    node.shutdown().await;
}
