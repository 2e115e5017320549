//! In-memory implementations of the storage capabilities with lazy TTL
//! expiry. Expiry is computed at write time so reads only compare Instants.
use crate::{KvCache, MessageStore, Result, StoredEnvelope, clamp_history_limit};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() < expires_at,
            None => true,
        }
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// TTL key-value map behind an RwLock. Expired entries are evicted on the
/// read that observes them.
#[derive(Debug, Default)]
pub struct MemoryCache {
    inner: RwLock<HashMap<String, Entry<Bytes>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvCache for MemoryCache {
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: expiry(ttl),
        };
        self.inner.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        // Take a write lock so the expired entry can be evicted in place.
        let mut guard = self.inner.write().await;
        if let Some(entry) = guard.get(key) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
            guard.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<Option<Bytes>> {
        let removed = self.inner.write().await.remove(key);
        Ok(removed.filter(|entry| entry.live()).map(|entry| entry.value))
    }

    async fn put_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool> {
        let mut guard = self.inner.write().await;
        if let Some(entry) = guard.get(key)
            && entry.live()
        {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct MessageState {
    offline: HashMap<u64, Entry<Vec<StoredEnvelope>>>,
    history: HashMap<(u64, u64), Entry<Vec<StoredEnvelope>>>,
    relations: HashMap<u64, Entry<HashSet<u64>>>,
}

/// In-memory [`MessageStore`]. One lock guards all three maps so a
/// save_message is atomic with respect to drains and reads.
#[derive(Debug)]
pub struct MemoryMessageStore {
    state: RwLock<MessageState>,
    message_ttl: Option<Duration>,
}

impl MemoryMessageStore {
    pub fn new(message_ttl: Option<Duration>) -> Self {
        Self {
            state: RwLock::new(MessageState::default()),
            message_ttl,
        }
    }

    fn push_history(&self, state: &mut MessageState, from: u64, to: u64, envelope: StoredEnvelope) {
        let key = crate::keys::canonical_pair(from, to);
        let expires_at = expiry(self.message_ttl);
        let entry = state.history.entry(key).or_insert_with(|| Entry {
            value: Vec::new(),
            expires_at,
        });
        if !entry.live() {
            entry.value.clear();
        }
        entry.value.push(envelope);
        // Every write refreshes the TTL.
        entry.expires_at = expires_at;
    }

    fn add_relation(&self, state: &mut MessageState, user: u64, counterpart: u64) {
        let expires_at = expiry(self.message_ttl);
        let entry = state.relations.entry(user).or_insert_with(|| Entry {
            value: HashSet::new(),
            expires_at,
        });
        if !entry.live() {
            entry.value.clear();
        }
        entry.value.insert(counterpart);
        entry.expires_at = expires_at;
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_message(&self, from_user_id: u64, to_user_id: u64, data: Bytes) -> Result<()> {
        let envelope = StoredEnvelope::new(from_user_id, to_user_id, data, now_unix());
        let mut state = self.state.write().await;
        let expires_at = expiry(self.message_ttl);
        let entry = state.offline.entry(to_user_id).or_insert_with(|| Entry {
            value: Vec::new(),
            expires_at,
        });
        if !entry.live() {
            entry.value.clear();
        }
        entry.value.push(envelope.clone());
        entry.expires_at = expires_at;

        self.push_history(&mut state, from_user_id, to_user_id, envelope);
        self.add_relation(&mut state, from_user_id, to_user_id);
        self.add_relation(&mut state, to_user_id, from_user_id);
        Ok(())
    }

    async fn save_history_only(
        &self,
        from_user_id: u64,
        to_user_id: u64,
        data: Bytes,
    ) -> Result<()> {
        let envelope = StoredEnvelope::new(from_user_id, to_user_id, data, now_unix());
        let mut state = self.state.write().await;
        self.push_history(&mut state, from_user_id, to_user_id, envelope);
        self.add_relation(&mut state, from_user_id, to_user_id);
        self.add_relation(&mut state, to_user_id, from_user_id);
        Ok(())
    }

    async fn save_offline_only(
        &self,
        from_user_id: u64,
        to_user_id: u64,
        data: Bytes,
    ) -> Result<()> {
        let envelope = StoredEnvelope::new(from_user_id, to_user_id, data, now_unix());
        let mut state = self.state.write().await;
        let expires_at = expiry(self.message_ttl);
        let entry = state.offline.entry(to_user_id).or_insert_with(|| Entry {
            value: Vec::new(),
            expires_at,
        });
        if !entry.live() {
            entry.value.clear();
        }
        entry.value.push(envelope);
        entry.expires_at = expires_at;
        self.add_relation(&mut state, from_user_id, to_user_id);
        self.add_relation(&mut state, to_user_id, from_user_id);
        Ok(())
    }

    async fn drain_offline(&self, user_id: u64) -> Result<Vec<StoredEnvelope>> {
        // Remove-and-return under one lock: the all-or-nothing contract.
        let removed = self.state.write().await.offline.remove(&user_id);
        Ok(removed
            .filter(|entry| entry.live())
            .map(|entry| entry.value)
            .unwrap_or_default())
    }

    async fn has_offline(&self, user_id: u64) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .offline
            .get(&user_id)
            .is_some_and(|entry| entry.live() && !entry.value.is_empty()))
    }

    async fn history(
        &self,
        user_a: u64,
        user_b: u64,
        limit: i64,
    ) -> Result<Vec<StoredEnvelope>> {
        let limit = clamp_history_limit(limit);
        let key = crate::keys::canonical_pair(user_a, user_b);
        let state = self.state.read().await;
        let Some(entry) = state.history.get(&key).filter(|entry| entry.live()) else {
            return Ok(Vec::new());
        };
        let skip = entry.value.len().saturating_sub(limit);
        Ok(entry.value[skip..].to_vec())
    }

    async fn relations(&self, user_id: u64) -> Result<Vec<u64>> {
        let state = self.state.read().await;
        let mut out: Vec<u64> = state
            .relations
            .get(&user_id)
            .filter(|entry| entry.live())
            .map(|entry| entry.value.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        Ok(out)
    }
}
