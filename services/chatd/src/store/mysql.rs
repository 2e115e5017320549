//! MySQL-backed [`DirectoryStore`].
//!
//! Authoritative tables: `users`, `chat_groups`, `group_members`, and the
//! sharded `group_messages_%02d` family. Membership mutations and the
//! `member_count` column commit in one transaction so the count can never
//! drift from the rows. Group messages shard by `group_id` with the CRC32
//! rule from [`shard`]; cross-shard reads iterate every shard and merge.
use super::{
    DirectoryStore, Group, GroupMember, GroupMessage, Role, StoreError, StoreResult, User,
    clamp_group_history_limit,
};
use crate::config::{MySqlConfig, ShardingConfig};
use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{FromRow, Row};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub mod shard {
    //! Shard index rules: CRC32 modulo for strings, raw modulo for ids.

    pub fn index_for_str(key: &str, shard_count: u32) -> u32 {
        crc32fast::hash(key.as_bytes()) % shard_count.max(1)
    }

    pub fn index_for_id(id: u64, shard_count: u32) -> u32 {
        (id % u64::from(shard_count.max(1))) as u32
    }

    pub fn table_name(prefix: &str, index: u32) -> String {
        format!("{prefix}_{index:02}")
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

const GROUP_MESSAGES_PREFIX: &str = "group_messages";

/// Row shapes are kept separate from the domain types so schema details
/// stay localized to this module.
#[derive(Debug, Clone, FromRow)]
struct DbUser {
    id: u64,
    user_uuid: String,
    username: String,
    password_hash: String,
    email: String,
    avatar: String,
    is_online: bool,
    last_login: i64,
    created_at: i64,
}

impl From<DbUser> for User {
    fn from(row: DbUser) -> Self {
        User {
            id: row.id,
            user_uuid: row.user_uuid,
            username: row.username,
            password_hash: row.password_hash,
            email: row.email,
            avatar: row.avatar,
            is_online: row.is_online,
            last_login: row.last_login,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct DbGroup {
    id: u64,
    name: String,
    owner_user_id: u64,
    description: String,
    avatar: String,
    member_count: u32,
    created_at: i64,
}

impl From<DbGroup> for Group {
    fn from(row: DbGroup) -> Self {
        Group {
            id: row.id,
            name: row.name,
            owner_user_id: row.owner_user_id,
            description: row.description,
            avatar: row.avatar,
            member_count: row.member_count,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct DbGroupMessage {
    msg_id: String,
    group_id: u64,
    sender_id: u64,
    sender_uuid: String,
    sender_name: String,
    content: String,
    message_type: String,
    created_at: i64,
}

impl From<DbGroupMessage> for GroupMessage {
    fn from(row: DbGroupMessage) -> Self {
        GroupMessage {
            msg_id: row.msg_id,
            group_id: row.group_id,
            sender_id: row.sender_id,
            sender_uuid: row.sender_uuid,
            sender_name: row.sender_name,
            content: row.content,
            message_type: row.message_type,
            created_at: row.created_at,
        }
    }
}

pub struct MySqlDirectory {
    pool: MySqlPool,
    shard_count: u32,
}

impl MySqlDirectory {
    /// Connect, apply the schema, and hand back a pooled store. Startup
    /// fails here rather than serving without tables.
    pub async fn connect(mysql: &MySqlConfig, sharding: &ShardingConfig) -> StoreResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(mysql.max_open_conns)
            .min_connections(mysql.max_idle_conns)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&mysql.url())
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        let shard_count = if sharding.enabled {
            sharding.shard_count.max(1)
        } else {
            1
        };
        let store = Self { pool, shard_count };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
                user_uuid VARCHAR(36) NOT NULL,
                username VARCHAR(64) NOT NULL,
                password_hash VARCHAR(128) NOT NULL,
                email VARCHAR(128) NOT NULL,
                avatar VARCHAR(256) NOT NULL DEFAULT '',
                is_online BOOLEAN NOT NULL DEFAULT FALSE,
                last_login BIGINT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                UNIQUE KEY uniq_user_uuid (user_uuid),
                UNIQUE KEY uniq_username (username)
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chat_groups (
                id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
                name VARCHAR(64) NOT NULL,
                owner_user_id BIGINT UNSIGNED NOT NULL,
                description VARCHAR(256) NOT NULL DEFAULT '',
                avatar VARCHAR(256) NOT NULL DEFAULT '',
                member_count INT UNSIGNED NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                UNIQUE KEY uniq_group_name (name)
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS group_members (
                group_id BIGINT UNSIGNED NOT NULL,
                user_id BIGINT UNSIGNED NOT NULL,
                role VARCHAR(16) NOT NULL,
                joined_at BIGINT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;

        for index in 0..self.shard_count {
            let table = shard::table_name(GROUP_MESSAGES_PREFIX, index);
            sqlx::query(&format!(
                r#"CREATE TABLE IF NOT EXISTS {table} (
                    msg_id VARCHAR(36) NOT NULL PRIMARY KEY,
                    group_id BIGINT UNSIGNED NOT NULL,
                    sender_id BIGINT UNSIGNED NOT NULL,
                    sender_uuid VARCHAR(36) NOT NULL,
                    sender_name VARCHAR(64) NOT NULL,
                    content TEXT NOT NULL,
                    message_type VARCHAR(16) NOT NULL,
                    created_at BIGINT NOT NULL,
                    KEY idx_group_created (group_id, created_at)
                )"#
            ))
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        }
        Ok(())
    }

    fn messages_table(&self, group_id: u64) -> String {
        shard::table_name(
            GROUP_MESSAGES_PREFIX,
            shard::index_for_id(group_id, self.shard_count),
        )
    }

    async fn fetch_user_where(&self, clause: &str, bind: &str) -> StoreResult<User> {
        let query = format!(
            "SELECT id, user_uuid, username, password_hash, email, avatar, is_online, last_login, created_at \
             FROM users WHERE {clause}"
        );
        let row: Option<DbUser> = sqlx::query_as(&query)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        row.map(User::from)
            .ok_or_else(|| StoreError::NotFound(format!("user {bind}")))
    }
}

fn is_duplicate_key(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl DirectoryStore for MySqlDirectory {
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: &str,
    ) -> StoreResult<User> {
        let user_uuid = Uuid::new_v4().to_string();
        let created_at = now_unix();
        let result = sqlx::query(
            "INSERT INTO users (user_uuid, username, password_hash, email, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&user_uuid)
        .bind(username)
        .bind(password_hash)
        .bind(email)
        .bind(created_at)
        .execute(&self.pool)
        .await;
        let result = match result {
            Ok(result) => result,
            Err(err) if is_duplicate_key(&err) => {
                return Err(StoreError::Conflict(format!(
                    "username already exists: {username}"
                )));
            }
            Err(err) => return Err(StoreError::Unexpected(err.into())),
        };
        Ok(User {
            id: result.last_insert_id(),
            user_uuid,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            email: email.to_string(),
            avatar: String::new(),
            is_online: false,
            last_login: 0,
            created_at,
        })
    }

    async fn user_by_id(&self, id: u64) -> StoreResult<User> {
        self.fetch_user_where("id = ?", &id.to_string()).await
    }

    async fn user_by_uuid(&self, user_uuid: &str) -> StoreResult<User> {
        self.fetch_user_where("user_uuid = ?", user_uuid).await
    }

    async fn user_by_username(&self, username: &str) -> StoreResult<User> {
        self.fetch_user_where("username = ?", username).await
    }

    async fn mark_login(&self, id: u64) -> StoreResult<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        let previous: Option<i64> = sqlx::query_scalar(
            "SELECT last_login FROM users WHERE id = ? FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        let Some(previous) = previous else {
            return Err(StoreError::NotFound(format!("user id {id}")));
        };
        sqlx::query("UPDATE users SET last_login = ?, is_online = TRUE WHERE id = ?")
            .bind(now_unix())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        tx.commit()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok(previous)
    }

    async fn mark_offline(&self, id: u64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET is_online = FALSE WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user id {id}")));
        }
        Ok(())
    }

    async fn create_group(
        &self,
        name: &str,
        owner_user_id: u64,
        description: &str,
        avatar: &str,
    ) -> StoreResult<Group> {
        let created_at = now_unix();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        let result = sqlx::query(
            "INSERT INTO chat_groups (name, owner_user_id, description, avatar, member_count, created_at) \
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(name)
        .bind(owner_user_id)
        .bind(description)
        .bind(avatar)
        .bind(created_at)
        .execute(&mut *tx)
        .await;
        let result = match result {
            Ok(result) => result,
            Err(err) if is_duplicate_key(&err) => {
                return Err(StoreError::Conflict(format!(
                    "group name already exists: {name}"
                )));
            }
            Err(err) => return Err(StoreError::Unexpected(err.into())),
        };
        let group_id = result.last_insert_id();
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(group_id)
        .bind(owner_user_id)
        .bind(Role::Owner.as_str())
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        tx.commit()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok(Group {
            id: group_id,
            name: name.to_string(),
            owner_user_id,
            description: description.to_string(),
            avatar: avatar.to_string(),
            member_count: 1,
            created_at,
        })
    }

    async fn group_by_id(&self, id: u64) -> StoreResult<Group> {
        let row: Option<DbGroup> = sqlx::query_as(
            "SELECT id, name, owner_user_id, description, avatar, member_count, created_at \
             FROM chat_groups WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        row.map(Group::from)
            .ok_or_else(|| StoreError::NotFound(format!("group id {id}")))
    }

    async fn join_group(&self, group_id: u64, user_id: u64) -> StoreResult<Group> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        let group: Option<DbGroup> = sqlx::query_as(
            "SELECT id, name, owner_user_id, description, avatar, member_count, created_at \
             FROM chat_groups WHERE id = ? FOR UPDATE",
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        let Some(group) = group else {
            return Err(StoreError::NotFound(format!("group id {group_id}")));
        };
        let insert = sqlx::query(
            "INSERT INTO group_members (group_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(group_id)
        .bind(user_id)
        .bind(Role::Member.as_str())
        .bind(now_unix())
        .execute(&mut *tx)
        .await;
        if let Err(err) = insert {
            if is_duplicate_key(&err) {
                return Err(StoreError::Conflict(format!(
                    "user {user_id} already in group {group_id}"
                )));
            }
            return Err(StoreError::Unexpected(err.into()));
        }
        // Count mutates in the same transaction as the membership row.
        sqlx::query("UPDATE chat_groups SET member_count = member_count + 1 WHERE id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        tx.commit()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        let mut group = Group::from(group);
        group.member_count += 1;
        Ok(group)
    }

    async fn leave_group(&self, group_id: u64, user_id: u64) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM group_members WHERE group_id = ? AND user_id = ? FOR UPDATE",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        let Some(role) = role else {
            return Err(StoreError::NotFound(format!(
                "user {user_id} not in group {group_id}"
            )));
        };
        if Role::parse(&role) == Some(Role::Owner) {
            let member_count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM group_members WHERE group_id = ?")
                    .bind(group_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|err| StoreError::Unexpected(err.into()))?;
            if member_count > 1 {
                return Err(StoreError::Conflict("owner cannot leave group".to_string()));
            }
            // Sole owner leaving dissolves the group.
            sqlx::query("DELETE FROM group_members WHERE group_id = ?")
                .bind(group_id)
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::Unexpected(err.into()))?;
            sqlx::query("DELETE FROM chat_groups WHERE id = ?")
                .bind(group_id)
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::Unexpected(err.into()))?;
            return tx
                .commit()
                .await
                .map_err(|err| StoreError::Unexpected(err.into()));
        }
        sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        sqlx::query("UPDATE chat_groups SET member_count = member_count - 1 WHERE id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        tx.commit()
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))
    }

    async fn is_member(&self, group_id: u64, user_id: u64) -> StoreResult<bool> {
        // Distinguish "no group" from "not a member".
        self.group_by_id(group_id).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ? AND user_id = ?",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok(count > 0)
    }

    async fn member_ids(&self, group_id: u64) -> StoreResult<Vec<u64>> {
        self.group_by_id(group_id).await?;
        let ids: Vec<u64> = sqlx::query_scalar(
            "SELECT user_id FROM group_members WHERE group_id = ? ORDER BY joined_at",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok(ids)
    }

    async fn members(&self, group_id: u64) -> StoreResult<Vec<GroupMember>> {
        self.group_by_id(group_id).await?;
        let rows = sqlx::query(
            "SELECT group_id, user_id, role, joined_at FROM group_members \
             WHERE group_id = ? ORDER BY joined_at",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        rows.into_iter()
            .map(|row| {
                let role: String = row.get("role");
                Ok(GroupMember {
                    group_id: row.get("group_id"),
                    user_id: row.get("user_id"),
                    role: Role::parse(&role)
                        .ok_or_else(|| StoreError::Unexpected(anyhow!("bad role: {role}")))?,
                    joined_at: row.get("joined_at"),
                })
            })
            .collect()
    }

    async fn user_groups(&self, user_id: u64) -> StoreResult<Vec<Group>> {
        let rows: Vec<DbGroup> = sqlx::query_as(
            "SELECT g.id, g.name, g.owner_user_id, g.description, g.avatar, g.member_count, g.created_at \
             FROM chat_groups g JOIN group_members m ON m.group_id = g.id \
             WHERE m.user_id = ? ORDER BY g.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok(rows.into_iter().map(Group::from).collect())
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
        let msg_id = Uuid::new_v4().to_string();
        let table = self.messages_table(group_id);
        sqlx::query(&format!(
            "INSERT INTO {table} (msg_id, group_id, sender_id, sender_uuid, sender_name, content, message_type, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&msg_id)
        .bind(group_id)
        .bind(sender_id)
        .bind(sender_uuid)
        .bind(sender_name)
        .bind(content)
        .bind(message_type)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok(msg_id)
    }

    async fn group_history(&self, group_id: u64, limit: i64) -> StoreResult<Vec<GroupMessage>> {
        let limit = clamp_group_history_limit(limit);
        let table = self.messages_table(group_id);
        let rows: Vec<DbGroupMessage> = sqlx::query_as(&format!(
            "SELECT msg_id, group_id, sender_id, sender_uuid, sender_name, content, message_type, created_at \
             FROM {table} WHERE group_id = ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(group_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Unexpected(err.into()))?;
        let mut messages: Vec<GroupMessage> = rows.into_iter().map(GroupMessage::from).collect();
        messages.reverse();
        Ok(messages)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "mysql"
    }
}
