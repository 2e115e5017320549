//! User/group directory store: the SQL-backed capability the routing and
//! auth layers consume. `memory` backs tests and single-node setups,
//! `mysql` is the production backend.
use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod mysql;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub user_uuid: String,
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub avatar: String,
    pub is_online: bool,
    /// Unix seconds of the most recent login; zero before the first.
    pub last_login: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: u64,
    pub name: String,
    pub owner_user_id: u64,
    pub description: String,
    pub avatar: String,
    pub member_count: u32,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: u64,
    pub user_id: u64,
    pub role: Role,
    pub joined_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// Server-assigned UUID.
    pub msg_id: String,
    pub group_id: u64,
    pub sender_id: u64,
    pub sender_uuid: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: String,
    pub created_at: i64,
}

/// Store contract.
///
/// Invariants every backend must keep:
/// - `username`, `user_uuid`, and `id` are each unique over users;
/// - `member_count` equals the membership rows and mutates in the same
///   transaction as them;
/// - a group has exactly one owner, and `leave_group` refuses to remove the
///   owner while other members remain (an owner leaving alone deletes the
///   group).
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: &str,
    ) -> StoreResult<User>;
    async fn user_by_id(&self, id: u64) -> StoreResult<User>;
    async fn user_by_uuid(&self, user_uuid: &str) -> StoreResult<User>;
    async fn user_by_username(&self, username: &str) -> StoreResult<User>;
    /// Set `is_online`, bump `last_login`, and return the previous
    /// `last_login` for the login response.
    async fn mark_login(&self, id: u64) -> StoreResult<i64>;
    async fn mark_offline(&self, id: u64) -> StoreResult<()>;

    async fn create_group(
        &self,
        name: &str,
        owner_user_id: u64,
        description: &str,
        avatar: &str,
    ) -> StoreResult<Group>;
    async fn group_by_id(&self, id: u64) -> StoreResult<Group>;
    async fn join_group(&self, group_id: u64, user_id: u64) -> StoreResult<Group>;
    async fn leave_group(&self, group_id: u64, user_id: u64) -> StoreResult<()>;
    async fn is_member(&self, group_id: u64, user_id: u64) -> StoreResult<bool>;
    async fn member_ids(&self, group_id: u64) -> StoreResult<Vec<u64>>;
    async fn members(&self, group_id: u64) -> StoreResult<Vec<GroupMember>>;
    async fn user_groups(&self, user_id: u64) -> StoreResult<Vec<Group>>;

    /// Persist a group message and return its server-assigned msg_id.
    async fn save_group_message(
        &self,
        group_id: u64,
        sender_id: u64,
        sender_uuid: &str,
        sender_name: &str,
        content: &str,
        message_type: &str,
    ) -> StoreResult<String>;
    /// Most recent messages for a group, oldest first, clamped to 100.
    async fn group_history(&self, group_id: u64, limit: i64) -> StoreResult<Vec<GroupMessage>>;

    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}

/// Group history fetch limits from the original router contract.
pub fn clamp_group_history_limit(limit: i64) -> usize {
    if limit <= 0 {
        20
    } else {
        limit.min(100) as usize
    }
}
