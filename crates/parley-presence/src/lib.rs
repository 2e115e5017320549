//! Online-presence registry capability.
//!
//! Presence answers one question: which node currently hosts a given user.
//! Records live under `users/online/<user_uuid>` in the cluster KV with a
//! TTL, and a record older than [`STALENESS_BOUND`] is treated as offline
//! and lazily deleted by the reader that observes it.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{RwLock, broadcast};

pub type Result<T> = std::result::Result<T, PresenceError>;

#[derive(thiserror::Error, Debug)]
pub enum PresenceError {
    #[error("presence registry unavailable: {0}")]
    Unavailable(String),
}

/// Records older than this are not trusted even if the TTL has not fired.
pub const STALENESS_BOUND: Duration = Duration::from_secs(300);

/// Default record TTL; must be at least the staleness bound.
pub const RECORD_TTL: Duration = Duration::from_secs(300);

/// Value stored under `users/online/<user_uuid>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub node_id: String,
    pub timestamp: i64,
}

/// Answer to a presence probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Live record: the user is reachable via this node.
    Node(String),
    /// No record, or the record was stale and has been removed.
    NotOnline,
}

/// Membership change notification for the chat node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Joined(String),
    Left(String),
}

#[async_trait::async_trait]
pub trait PresenceRegistry: Send + Sync {
    /// Write the presence record for a user, overwriting any prior owner.
    async fn set_online(&self, user_uuid: &str, node_id: &str) -> Result<()>;
    async fn set_offline(&self, user_uuid: &str) -> Result<()>;
    /// Resolve the hosting node. Stale records are deleted and reported as
    /// [`Location::NotOnline`].
    async fn get_server(&self, user_uuid: &str) -> Result<Location>;
    /// All live records, stale entries filtered out.
    async fn list_online(&self) -> Result<HashMap<String, String>>;
    /// Subscribe to chat-node membership changes.
    fn watch(&self) -> broadcast::Receiver<NodeEvent>;
    /// Register this node with the chat service set.
    async fn register_node(&self, node_id: &str) -> Result<()>;
    async fn deregister_node(&self, node_id: &str) -> Result<()>;
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug)]
struct StoredRecord {
    record: PresenceRecord,
    written_at: Instant,
}

/// Shared in-memory presence registry. Multiple node instances hold clones
/// of one `Arc<MemoryPresence>`, which is exactly the shared-KV topology a
/// cluster deployment gets from its service registry.
#[derive(Debug)]
pub struct MemoryPresence {
    records: RwLock<HashMap<String, StoredRecord>>,
    nodes: RwLock<Vec<String>>,
    events: broadcast::Sender<NodeEvent>,
    staleness_bound: Duration,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::with_staleness_bound(STALENESS_BOUND)
    }

    /// Test hook: shrink the staleness window.
    pub fn with_staleness_bound(staleness_bound: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            records: RwLock::new(HashMap::new()),
            nodes: RwLock::new(Vec::new()),
            events,
            staleness_bound,
        }
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PresenceRegistry for MemoryPresence {
    async fn set_online(&self, user_uuid: &str, node_id: &str) -> Result<()> {
        let stored = StoredRecord {
            record: PresenceRecord {
                node_id: node_id.to_string(),
                timestamp: now_unix(),
            },
            written_at: Instant::now(),
        };
        // Last writer wins; displacement on the losing node reconciles later.
        self.records
            .write()
            .await
            .insert(user_uuid.to_string(), stored);
        Ok(())
    }

    async fn set_offline(&self, user_uuid: &str) -> Result<()> {
        self.records.write().await.remove(user_uuid);
        Ok(())
    }

    async fn get_server(&self, user_uuid: &str) -> Result<Location> {
        let mut guard = self.records.write().await;
        match guard.get(user_uuid) {
            Some(stored) if stored.written_at.elapsed() <= self.staleness_bound => {
                Ok(Location::Node(stored.record.node_id.clone()))
            }
            Some(_) => {
                // Stale: delete on read and report offline.
                guard.remove(user_uuid);
                Ok(Location::NotOnline)
            }
            None => Ok(Location::NotOnline),
        }
    }

    async fn list_online(&self) -> Result<HashMap<String, String>> {
        let mut guard = self.records.write().await;
        guard.retain(|_, stored| stored.written_at.elapsed() <= self.staleness_bound);
        Ok(guard
            .iter()
            .map(|(uuid, stored)| (uuid.clone(), stored.record.node_id.clone()))
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    async fn register_node(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if !nodes.iter().any(|node| node == node_id) {
            nodes.push(node_id.to_string());
            let _ = self.events.send(NodeEvent::Joined(node_id.to_string()));
        }
        Ok(())
    }

    async fn deregister_node(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if let Some(pos) = nodes.iter().position(|node| node == node_id) {
            nodes.remove(pos);
            let _ = self.events.send(NodeEvent::Left(node_id.to_string()));
        }
        Ok(())
    }
}
