//! Group lifecycle and group chat on a single node.
mod common;

use chatd::store::DirectoryStore as _;
use common::{TestCluster, register_and_login};
use parley_client::ChatClient;
use parley_proto::{GroupTextMsgPush, group_status, msg_id};
use std::time::Duration;

const PUSH_WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn create_join_members_and_lists() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("alice");
    let bob = ChatClient::connect(node.addr()).await.expect("bob");
    let alice_id = register_and_login(&alice, "alice", "123456", "alice@x").await;
    let bob_id = register_and_login(&bob, "bob", "123456", "bob@x").await;

    let group = alice
        .create_group("devs", "dev chatter", "")
        .await
        .expect("create");
    assert_eq!(group.owner_user_id, alice_id.id);
    assert_eq!(group.member_count, 1);

    bob.join_group(group.id).await.expect("join");
    // Joining twice is tolerated.
    bob.join_group(group.id).await.expect("rejoin");

    let members = alice.group_members(group.id).await.expect("members");
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].user_id, alice_id.id);
    assert_eq!(members[0].role, "owner");
    assert_eq!(members[1].user_id, bob_id.id);
    assert_eq!(members[1].role, "member");

    let groups = bob.user_groups().await.expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].member_count, 2);

    // Non-members cannot read the roster.
    let carol = ChatClient::connect(node.addr()).await.expect("carol");
    register_and_login(&carol, "carol", "123456", "carol@x").await;
    let err = carol.group_members(group.id).await.expect_err("gated");
    assert!(err.to_string().contains("not a member"));

    alice.close().await;
    bob.close().await;
    carol.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn owner_cannot_leave_a_populated_group() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("alice");
    let bob = ChatClient::connect(node.addr()).await.expect("bob");
    register_and_login(&alice, "alice", "123456", "alice@x").await;
    register_and_login(&bob, "bob", "123456", "bob@x").await;

    let group = alice.create_group("devs", "", "").await.expect("create");
    bob.join_group(group.id).await.expect("join");

    let err = alice.leave_group(group.id).await.expect_err("owner leave");
    assert!(err.to_string().contains("owner cannot leave"));

    // Members can leave; the sole owner then dissolves the group.
    bob.leave_group(group.id).await.expect("bob leaves");
    alice.leave_group(group.id).await.expect("dissolve");
    let err = bob.join_group(group.id).await.expect_err("gone");
    assert!(err.to_string().contains("group not found"));

    alice.close().await;
    bob.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn group_text_fans_out_locally_and_persists() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("alice");
    let bob = ChatClient::connect(node.addr()).await.expect("bob");
    let alice_id = register_and_login(&alice, "alice", "123456", "alice@x").await;
    register_and_login(&bob, "bob", "123456", "bob@x").await;

    let group = alice.create_group("devs", "", "").await.expect("create");
    bob.join_group(group.id).await.expect("join");

    let resp = alice
        .send_group_text(group.id, "hello G")
        .await
        .expect("group send");
    assert_eq!(resp.status, group_status::OK);
    let stored_id = resp.msg_id.expect("msg id");
    assert!(!stored_id.is_empty());

    let push = bob.next_push(PUSH_WAIT).await.expect("push");
    assert_eq!(push.msg_id, msg_id::GROUP_TEXT_MSG_PUSH);
    let body: GroupTextMsgPush = serde_json::from_slice(&push.payload).expect("decode");
    assert_eq!(body.group_id, group.id);
    assert_eq!(body.from_user_id, alice_id.id);
    assert_eq!(body.from_username, "alice");
    assert_eq!(body.content, "hello G");

    // The sender gets no echo of their own message.
    assert!(alice.next_push(Duration::from_millis(300)).await.is_err());

    // Persisted with the acked msg_id.
    let history = cluster
        .directory
        .group_history(group.id, 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].msg_id, stored_id);
    assert_eq!(history[0].sender_id, alice_id.id);
    assert_eq!(history[0].content, "hello G");

    alice.close().await;
    bob.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn non_members_cannot_send_group_text() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("n1").await;

    let alice = ChatClient::connect(node.addr()).await.expect("alice");
    let mallory = ChatClient::connect(node.addr()).await.expect("mallory");
    register_and_login(&alice, "alice", "123456", "alice@x").await;
    register_and_login(&mallory, "mallory", "123456", "mallory@x").await;

    let group = alice.create_group("devs", "", "").await.expect("create");
    let resp = mallory
        .send_group_text(group.id, "let me in")
        .await
        .expect("response");
    assert_eq!(resp.status, group_status::NOT_A_MEMBER);
    assert!(resp.msg_id.is_none());

    // A group that does not exist fails the membership check.
    let resp = mallory.send_group_text(9999, "hello?").await.expect("response");
    assert_eq!(resp.status, group_status::MEMBERSHIP_CHECK_FAILED);

    alice.close().await;
    mallory.close().await;
    node.shutdown().await;
}
