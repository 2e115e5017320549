//! Cached session-token mirror: `session:<user_id>` holds the live bearer
//! token so other nodes (and logout) can cross-check or revoke it.
use crate::Result;
use bytes::Bytes;
use parley_storage::{KvCache, keys};
use std::sync::Arc;
use std::time::Duration;

pub struct SessionMirror {
    cache: Arc<dyn KvCache>,
    ttl: Duration,
}

impl SessionMirror {
    pub fn new(cache: Arc<dyn KvCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub async fn store(&self, user_id: u64, token: &str) -> Result<()> {
        self.cache
            .put(
                &keys::session(user_id),
                Bytes::from(token.to_string()),
                Some(self.ttl),
            )
            .await?;
        Ok(())
    }

    /// True when the cached token exists and matches.
    pub async fn check(&self, user_id: u64, token: &str) -> Result<bool> {
        let cached = self.cache.get(&keys::session(user_id)).await?;
        Ok(cached.is_some_and(|bytes| bytes.as_ref() == token.as_bytes()))
    }

    pub async fn clear(&self, user_id: u64) -> Result<()> {
        self.cache.delete(&keys::session(user_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_storage::MemoryCache;

    #[tokio::test]
    async fn store_check_clear() {
        let mirror = SessionMirror::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));
        mirror.store(1, "tok-a").await.expect("store");
        assert!(mirror.check(1, "tok-a").await.expect("check"));
        assert!(!mirror.check(1, "tok-b").await.expect("check"));
        assert!(!mirror.check(2, "tok-a").await.expect("check"));

        mirror.clear(1).await.expect("clear");
        assert!(!mirror.check(1, "tok-a").await.expect("check"));
    }
}
