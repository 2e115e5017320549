//! Message persistence capabilities: the per-user offline queue, the per-pair
//! history log, chat relations, and a generic TTL key-value cache.
//!
//! The traits here are the seam to the deployment's cache cluster; the
//! in-memory implementations in [`memory`] carry the same contracts and back
//! the test suites and single-node setups.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod keys;
pub mod memory;

pub use memory::{MemoryCache, MemoryMessageStore};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("stored envelope rejected: {0}")]
    InvalidEnvelope(String),
}

/// History fetch limit defaults to 50 and never exceeds 200.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 200;

/// Clamp a client-supplied history limit into the allowed window.
pub fn clamp_history_limit(limit: i64) -> usize {
    if limit <= 0 {
        DEFAULT_HISTORY_LIMIT as usize
    } else {
        limit.min(MAX_HISTORY_LIMIT) as usize
    }
}

/// Canonical stored form of a routed message.
///
/// `data` is the exact frame payload the sender's node routed, so a drained
/// offline message can be replayed to the recipient byte for byte. In the
/// JSON encoding `data` is base64; any other shape is rejected on read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredEnvelope {
    pub from_user_id: String,
    pub to_user_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    pub timestamp: i64,
}

impl StoredEnvelope {
    pub fn new(from_user_id: u64, to_user_id: u64, data: Bytes, timestamp: i64) -> Self {
        Self {
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            data,
            timestamp,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// TTL key-value cache capability. Backed by the deployment's cache cluster
/// in production; sessions and signature nonces live here.
#[async_trait::async_trait]
pub trait KvCache: Send + Sync {
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn delete(&self, key: &str) -> Result<Option<Bytes>>;
    /// Atomically record `key` if absent; returns false when it already
    /// existed. This is the nonce replay check.
    async fn put_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool>;
}

/// Offline queue + history log + chat relations.
///
/// Contract carried over from the cache key schema:
/// - every write refreshes the key TTL;
/// - `save_message` writes offline, history, and both relation sets;
/// - `save_history_only` skips the offline queue (delivery already
///   succeeded);
/// - `drain_offline` is all-or-nothing: the returned envelopes are removed
///   in the same operation, and a concurrent drain sees an empty queue;
/// - history order is append order, and both directions of a pair share one
///   log via the canonical `(min, max)` key.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, from_user_id: u64, to_user_id: u64, data: Bytes) -> Result<()>;
    async fn save_history_only(
        &self,
        from_user_id: u64,
        to_user_id: u64,
        data: Bytes,
    ) -> Result<()>;
    /// Offline queue only. Used on the subscriber side of a cross-node
    /// delivery, where the sending node already wrote the history entry.
    async fn save_offline_only(
        &self,
        from_user_id: u64,
        to_user_id: u64,
        data: Bytes,
    ) -> Result<()>;
    async fn drain_offline(&self, user_id: u64) -> Result<Vec<StoredEnvelope>>;
    async fn has_offline(&self, user_id: u64) -> Result<bool>;
    /// Last `limit` envelopes for the pair, oldest first. `limit` is clamped
    /// by [`clamp_history_limit`].
    async fn history(
        &self,
        user_a: u64,
        user_b: u64,
        limit: i64,
    ) -> Result<Vec<StoredEnvelope>>;
    async fn relations(&self, user_id: u64) -> Result<Vec<u64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_uses_default_for_non_positive() {
        assert_eq!(clamp_history_limit(0), 50);
        assert_eq!(clamp_history_limit(-3), 50);
    }

    #[test]
    fn clamp_caps_large_limits() {
        assert_eq!(clamp_history_limit(201), 200);
        assert_eq!(clamp_history_limit(10_000), 200);
        assert_eq!(clamp_history_limit(17), 17);
    }

    #[test]
    fn envelope_data_encodes_as_base64() {
        let envelope = StoredEnvelope::new(1, 2, Bytes::from_static(b"payload"), 1_700_000_000);
        let json = serde_json::to_value(&envelope).expect("encode");
        assert_eq!(json["data"], "cGF5bG9hZA==");
        let back: StoredEnvelope = serde_json::from_value(json).expect("decode");
        assert_eq!(back, envelope);
    }

    #[test]
    fn envelope_rejects_non_base64_data() {
        let raw = r#"{"from_user_id":"1","to_user_id":"2","data":"{not base64}","timestamp":0}"#;
        assert!(serde_json::from_str::<StoredEnvelope>(raw).is_err());
    }
}
