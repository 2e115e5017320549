//! In-memory [`DirectoryStore`] used by the test suites and single-node
//! development setups. One lock guards the whole state so membership and
//! member_count can never diverge.
use super::{
    DirectoryStore, Group, GroupMember, GroupMessage, Role, StoreError, StoreResult, User,
    clamp_group_history_limit,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Default)]
struct DirectoryState {
    users: HashMap<u64, User>,
    users_by_name: HashMap<String, u64>,
    users_by_uuid: HashMap<String, u64>,
    next_user_id: u64,
    groups: HashMap<u64, Group>,
    groups_by_name: HashMap<String, u64>,
    members: HashMap<u64, Vec<GroupMember>>,
    group_messages: HashMap<u64, Vec<GroupMessage>>,
    next_group_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: &str,
    ) -> StoreResult<User> {
        let mut state = self.state.write().await;
        if state.users_by_name.contains_key(username) {
            return Err(StoreError::Conflict(format!(
                "username already exists: {username}"
            )));
        }
        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            user_uuid: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            email: email.to_string(),
            avatar: String::new(),
            is_online: false,
            last_login: 0,
            created_at: now_unix(),
        };
        state.users_by_name.insert(user.username.clone(), user.id);
        state.users_by_uuid.insert(user.user_uuid.clone(), user.id);
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_id(&self, id: u64) -> StoreResult<User> {
        self.state
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user id {id}")))
    }

    async fn user_by_uuid(&self, user_uuid: &str) -> StoreResult<User> {
        let state = self.state.read().await;
        state
            .users_by_uuid
            .get(user_uuid)
            .and_then(|id| state.users.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user uuid {user_uuid}")))
    }

    async fn user_by_username(&self, username: &str) -> StoreResult<User> {
        let state = self.state.read().await;
        state
            .users_by_name
            .get(username)
            .and_then(|id| state.users.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("username {username}")))
    }

    async fn mark_login(&self, id: u64) -> StoreResult<i64> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user id {id}")))?;
        let previous = user.last_login;
        user.last_login = now_unix();
        user.is_online = true;
        Ok(previous)
    }

    async fn mark_offline(&self, id: u64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user id {id}")))?;
        user.is_online = false;
        Ok(())
    }

    async fn create_group(
        &self,
        name: &str,
        owner_user_id: u64,
        description: &str,
        avatar: &str,
    ) -> StoreResult<Group> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&owner_user_id) {
            return Err(StoreError::NotFound(format!("user id {owner_user_id}")));
        }
        if state.groups_by_name.contains_key(name) {
            return Err(StoreError::Conflict(format!(
                "group name already exists: {name}"
            )));
        }
        state.next_group_id += 1;
        let group = Group {
            id: state.next_group_id,
            name: name.to_string(),
            owner_user_id,
            description: description.to_string(),
            avatar: avatar.to_string(),
            member_count: 1,
            created_at: now_unix(),
        };
        state.groups_by_name.insert(group.name.clone(), group.id);
        state.groups.insert(group.id, group.clone());
        state.members.insert(
            group.id,
            vec![GroupMember {
                group_id: group.id,
                user_id: owner_user_id,
                role: Role::Owner,
                joined_at: group.created_at,
            }],
        );
        Ok(group)
    }

    async fn group_by_id(&self, id: u64) -> StoreResult<Group> {
        self.state
            .read()
            .await
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("group id {id}")))
    }

    async fn join_group(&self, group_id: u64, user_id: u64) -> StoreResult<Group> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&user_id) {
            return Err(StoreError::NotFound(format!("user id {user_id}")));
        }
        if !state.groups.contains_key(&group_id) {
            return Err(StoreError::NotFound(format!("group id {group_id}")));
        }
        let members = state.members.entry(group_id).or_default();
        if members.iter().any(|member| member.user_id == user_id) {
            return Err(StoreError::Conflict(format!(
                "user {user_id} already in group {group_id}"
            )));
        }
        members.push(GroupMember {
            group_id,
            user_id,
            role: Role::Member,
            joined_at: now_unix(),
        });
        // Count and membership mutate under the same lock.
        let count = members.len() as u32;
        let group = state.groups.get_mut(&group_id).expect("group checked above");
        group.member_count = count;
        Ok(group.clone())
    }

    async fn leave_group(&self, group_id: u64, user_id: u64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let members = state
            .members
            .get_mut(&group_id)
            .ok_or_else(|| StoreError::NotFound(format!("group id {group_id}")))?;
        let Some(pos) = members.iter().position(|member| member.user_id == user_id) else {
            return Err(StoreError::NotFound(format!(
                "user {user_id} not in group {group_id}"
            )));
        };
        if members[pos].role == Role::Owner {
            if members.len() > 1 {
                return Err(StoreError::Conflict(
                    "owner cannot leave group".to_string(),
                ));
            }
            // Sole owner leaving dissolves the group.
            state.members.remove(&group_id);
            state.group_messages.remove(&group_id);
            if let Some(group) = state.groups.remove(&group_id) {
                state.groups_by_name.remove(&group.name);
            }
            return Ok(());
        }
        members.remove(pos);
        let count = members.len() as u32;
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| StoreError::NotFound(format!("group id {group_id}")))?;
        group.member_count = count;
        Ok(())
    }

    async fn is_member(&self, group_id: u64, user_id: u64) -> StoreResult<bool> {
        let state = self.state.read().await;
        if !state.groups.contains_key(&group_id) {
            return Err(StoreError::NotFound(format!("group id {group_id}")));
        }
        Ok(state
            .members
            .get(&group_id)
            .is_some_and(|members| members.iter().any(|member| member.user_id == user_id)))
    }

    async fn member_ids(&self, group_id: u64) -> StoreResult<Vec<u64>> {
        let state = self.state.read().await;
        state
            .members
            .get(&group_id)
            .map(|members| members.iter().map(|member| member.user_id).collect())
            .ok_or_else(|| StoreError::NotFound(format!("group id {group_id}")))
    }

    async fn members(&self, group_id: u64) -> StoreResult<Vec<GroupMember>> {
        let state = self.state.read().await;
        state
            .members
            .get(&group_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("group id {group_id}")))
    }

    async fn user_groups(&self, user_id: u64) -> StoreResult<Vec<Group>> {
        let state = self.state.read().await;
        let mut groups: Vec<Group> = state
            .members
            .iter()
            .filter(|(_, members)| members.iter().any(|member| member.user_id == user_id))
            .filter_map(|(group_id, _)| state.groups.get(group_id).cloned())
            .collect();
        groups.sort_by_key(|group| group.id);
        Ok(groups)
    }

    async fn save_group_message(
        &self,
        group_id: u64,
        sender_id: u64,
        sender_uuid: &str,
        sender_name: &str,
        content: &str,
        message_type: &str,
    ) -> StoreResult<String> {
        let mut state = self.state.write().await;
        if !state.groups.contains_key(&group_id) {
            return Err(StoreError::NotFound(format!("group id {group_id}")));
        }
        let message = GroupMessage {
            msg_id: Uuid::new_v4().to_string(),
            group_id,
            sender_id,
            sender_uuid: sender_uuid.to_string(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            message_type: message_type.to_string(),
            created_at: now_unix(),
        };
        let msg_id = message.msg_id.clone();
        state.group_messages.entry(group_id).or_default().push(message);
        Ok(msg_id)
    }

    async fn group_history(&self, group_id: u64, limit: i64) -> StoreResult<Vec<GroupMessage>> {
        let limit = clamp_group_history_limit(limit);
        let state = self.state.read().await;
        let messages = state
            .group_messages
            .get(&group_id)
            .map(|messages| {
                let skip = messages.len().saturating_sub(limit);
                messages[skip..].to_vec()
            })
            .unwrap_or_default();
        Ok(messages)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_user_enforces_unique_username() {
        let store = MemoryDirectory::new();
        let alice = store.create_user("alice", "h", "a@x").await.expect("create");
        assert_eq!(alice.id, 1);
        assert!(!alice.user_uuid.is_empty());

        let err = store
            .create_user("alice", "h", "a2@x")
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn lookups_cover_all_three_identities() {
        let store = MemoryDirectory::new();
        let alice = store.create_user("alice", "h", "a@x").await.expect("create");
        assert_eq!(store.user_by_id(alice.id).await.expect("by id"), alice);
        assert_eq!(
            store.user_by_uuid(&alice.user_uuid).await.expect("by uuid"),
            alice
        );
        assert_eq!(
            store.user_by_username("alice").await.expect("by name"),
            alice
        );
        assert!(matches!(
            store.user_by_username("bob").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mark_login_returns_previous_timestamp() {
        let store = MemoryDirectory::new();
        let alice = store.create_user("alice", "h", "a@x").await.expect("create");
        let first = store.mark_login(alice.id).await.expect("login");
        assert_eq!(first, 0);
        let second = store.mark_login(alice.id).await.expect("login");
        assert!(second > 0);
        assert!(store.user_by_id(alice.id).await.expect("get").is_online);
    }

    #[tokio::test]
    async fn member_count_tracks_membership() {
        let store = MemoryDirectory::new();
        let alice = store.create_user("alice", "h", "a@x").await.expect("create");
        let bob = store.create_user("bob", "h", "b@x").await.expect("create");
        let group = store
            .create_group("dev", alice.id, "", "")
            .await
            .expect("group");
        assert_eq!(group.member_count, 1);

        let group = store.join_group(group.id, bob.id).await.expect("join");
        assert_eq!(group.member_count, 2);
        assert_eq!(
            store.members(group.id).await.expect("members").len() as u32,
            group.member_count
        );

        store.leave_group(group.id, bob.id).await.expect("leave");
        assert_eq!(
            store.group_by_id(group.id).await.expect("get").member_count,
            1
        );
    }

    #[tokio::test]
    async fn duplicate_join_conflicts() {
        let store = MemoryDirectory::new();
        let alice = store.create_user("alice", "h", "a@x").await.expect("create");
        let group = store
            .create_group("dev", alice.id, "", "")
            .await
            .expect("group");
        let err = store
            .join_group(group.id, alice.id)
            .await
            .expect_err("owner already member");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn owner_cannot_leave_populated_group() {
        let store = MemoryDirectory::new();
        let alice = store.create_user("alice", "h", "a@x").await.expect("create");
        let bob = store.create_user("bob", "h", "b@x").await.expect("create");
        let group = store
            .create_group("dev", alice.id, "", "")
            .await
            .expect("group");
        store.join_group(group.id, bob.id).await.expect("join");

        let err = store
            .leave_group(group.id, alice.id)
            .await
            .expect_err("owner leave");
        assert!(matches!(err, StoreError::Conflict(_)));

        // Alone, the owner leaving dissolves the group.
        store.leave_group(group.id, bob.id).await.expect("leave");
        store.leave_group(group.id, alice.id).await.expect("dissolve");
        assert!(matches!(
            store.group_by_id(group.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn group_history_clamps_and_orders() {
        let store = MemoryDirectory::new();
        let alice = store.create_user("alice", "h", "a@x").await.expect("create");
        let group = store
            .create_group("dev", alice.id, "", "")
            .await
            .expect("group");
        for i in 0..30 {
            store
                .save_group_message(group.id, alice.id, &alice.user_uuid, "alice", &format!("m{i}"), "text")
                .await
                .expect("save");
        }
        let history = store.group_history(group.id, 0).await.expect("history");
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].content, "m10");
        assert_eq!(history[19].content, "m29");
        assert!(!history[0].msg_id.is_empty());
    }

    #[tokio::test]
    async fn user_groups_lists_memberships() {
        let store = MemoryDirectory::new();
        let alice = store.create_user("alice", "h", "a@x").await.expect("create");
        let bob = store.create_user("bob", "h", "b@x").await.expect("create");
        let dev = store
            .create_group("dev", alice.id, "", "")
            .await
            .expect("group");
        let ops = store.create_group("ops", bob.id, "", "").await.expect("group");
        store.join_group(ops.id, alice.id).await.expect("join");

        let groups = store.user_groups(alice.id).await.expect("groups");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, dev.id);
        assert_eq!(groups[1].id, ops.id);
    }
}
