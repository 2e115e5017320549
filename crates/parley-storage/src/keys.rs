//! Cache key schema. Every key the core writes is built here so the
//! keyspace stays greppable.

/// Per-recipient offline queue: `offline:msg:<user_id>`.
pub fn offline(user_id: u64) -> String {
    format!("offline:msg:{user_id}")
}

/// Per-pair history log: `history:msg:<min_id>:<max_id>`. The canonical
/// ordering means both directions of a conversation share one list.
pub fn history(user_a: u64, user_b: u64) -> String {
    let (low, high) = canonical_pair(user_a, user_b);
    format!("history:msg:{low}:{high}")
}

/// Chat counterpart set: `chat:relation:<user_id>`.
pub fn relation(user_id: u64) -> String {
    format!("chat:relation:{user_id}")
}

/// Cached bearer token mirror: `session:<user_id>`.
pub fn session(user_id: u64) -> String {
    format!("session:{user_id}")
}

/// Single-use signature nonce: `nonce:<nonce>`.
pub fn nonce(nonce: &str) -> String {
    format!("nonce:{nonce}")
}

pub fn canonical_pair(a: u64, b: u64) -> (u64, u64) {
    if a <= b { (a, b) } else { (b, a) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_key_is_direction_independent() {
        assert_eq!(history(9, 4), history(4, 9));
        assert_eq!(history(9, 4), "history:msg:4:9");
    }

    #[test]
    fn keys_embed_ids() {
        assert_eq!(offline(12), "offline:msg:12");
        assert_eq!(relation(3), "chat:relation:3");
        assert_eq!(session(7), "session:7");
        assert_eq!(nonce("abc"), "nonce:abc");
    }
}
