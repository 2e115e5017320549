//! Process-local connection index: `conn_id -> Session` plus at most one
//! bound session per user. Mutations are brief pointer swaps under a write
//! lock; iteration snapshots so no lock is held across I/O.
use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct RegistryState {
    by_conn: HashMap<u64, Arc<Session>>,
    by_user: HashMap<u64, u64>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        let mut state = self.state.write().expect("registry lock");
        state.by_conn.insert(session.conn_id(), session);
    }

    /// Remove a connection and any user binding pointing at it.
    pub fn remove(&self, conn_id: u64) -> Option<Arc<Session>> {
        let mut state = self.state.write().expect("registry lock");
        let session = state.by_conn.remove(&conn_id)?;
        state.by_user.retain(|_, bound| *bound != conn_id);
        Some(session)
    }

    /// Bind a user to a connection. If another live session already holds
    /// the binding, it is closed and returned so the caller can finish its
    /// teardown: newest login wins.
    pub fn bind(&self, user_id: u64, conn_id: u64) -> Option<Arc<Session>> {
        let displaced = {
            let mut state = self.state.write().expect("registry lock");
            let displaced = state
                .by_user
                .insert(user_id, conn_id)
                .filter(|prior| *prior != conn_id)
                .and_then(|prior| state.by_conn.remove(&prior));
            displaced
        };
        // Close outside the lock; close never blocks but keeps the critical
        // section to pure map edits.
        if let Some(ref session) = displaced {
            session.close();
        }
        displaced
    }

    pub fn unbind(&self, user_id: u64, conn_id: u64) {
        let mut state = self.state.write().expect("registry lock");
        if state.by_user.get(&user_id) == Some(&conn_id) {
            state.by_user.remove(&user_id);
        }
    }

    pub fn by_conn_id(&self, conn_id: u64) -> Option<Arc<Session>> {
        self.state
            .read()
            .expect("registry lock")
            .by_conn
            .get(&conn_id)
            .cloned()
    }

    pub fn by_user_id(&self, user_id: u64) -> Option<Arc<Session>> {
        let state = self.state.read().expect("registry lock");
        state
            .by_user
            .get(&user_id)
            .and_then(|conn_id| state.by_conn.get(conn_id))
            .cloned()
    }

    /// Snapshot of every session; callers iterate without holding the lock.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.state
            .read()
            .expect("registry lock")
            .by_conn
            .values()
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.state.read().expect("registry lock").by_conn.len()
    }

    /// Count of authenticated (user-bound) sessions.
    pub fn bound_users(&self) -> usize {
        self.state.read().expect("registry lock").by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    async fn session(conn_id: u64) -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let (_, write_half) = server.into_split();
        let (session, _writer) =
            Session::start(conn_id, client.local_addr().expect("peer"), write_half, 4);
        // Leak the client half; tests only need the session object.
        std::mem::forget(client);
        session
    }

    #[tokio::test]
    async fn add_lookup_remove() {
        let registry = ConnectionRegistry::new();
        let s1 = session(1).await;
        registry.add(Arc::clone(&s1));
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.by_conn_id(1).expect("found").conn_id(), 1);

        registry.remove(1);
        assert!(registry.by_conn_id(1).is_none());
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn bind_displaces_previous_session() {
        let registry = ConnectionRegistry::new();
        let old = session(1).await;
        let new = session(2).await;
        registry.add(Arc::clone(&old));
        registry.add(Arc::clone(&new));

        assert!(registry.bind(7, 1).is_none());
        assert_eq!(registry.by_user_id(7).expect("bound").conn_id(), 1);

        // Newest wins: the old session is closed and dropped from the index.
        let displaced = registry.bind(7, 2).expect("displaced");
        assert_eq!(displaced.conn_id(), 1);
        assert!(displaced.is_closed());
        assert_eq!(registry.by_user_id(7).expect("bound").conn_id(), 2);
        assert!(registry.by_conn_id(1).is_none());
    }

    #[tokio::test]
    async fn rebind_same_connection_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        let s1 = session(1).await;
        registry.add(Arc::clone(&s1));
        assert!(registry.bind(7, 1).is_none());
        assert!(registry.bind(7, 1).is_none());
        assert!(!s1.is_closed());
    }

    #[tokio::test]
    async fn remove_clears_user_binding() {
        let registry = ConnectionRegistry::new();
        let s1 = session(1).await;
        registry.add(Arc::clone(&s1));
        registry.bind(7, 1);
        assert_eq!(registry.bound_users(), 1);

        registry.remove(1);
        assert!(registry.by_user_id(7).is_none());
        assert_eq!(registry.bound_users(), 0);
    }

    #[tokio::test]
    async fn unbind_only_removes_matching_connection() {
        let registry = ConnectionRegistry::new();
        let s1 = session(1).await;
        let s2 = session(2).await;
        registry.add(Arc::clone(&s1));
        registry.add(Arc::clone(&s2));
        registry.bind(7, 1);
        registry.bind(7, 2);

        // A stale unbind from the displaced connection must not clear the
        // fresh binding.
        registry.unbind(7, 1);
        assert_eq!(registry.by_user_id(7).expect("bound").conn_id(), 2);
        registry.unbind(7, 2);
        assert!(registry.by_user_id(7).is_none());
    }
}
