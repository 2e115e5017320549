//! Heartbeat supervisor: a periodic sweep that closes sessions silent for
//! longer than the configured timeout. `last_seen` advances on every
//! inbound frame, so any traffic keeps a session alive, not only pings.
use crate::config::HeartbeatConfig;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn spawn(registry: Arc<ConnectionRegistry>, config: HeartbeatConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let timeout = config.timeout_secs as i64;
        loop {
            ticker.tick().await;
            // Snapshot; closing happens outside any registry lock.
            for session in registry.all() {
                let idle = session.idle_secs();
                if idle > timeout {
                    tracing::warn!(
                        conn_id = session.conn_id(),
                        idle_secs = idle,
                        "closing silent session"
                    );
                    session.close();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn silent_sessions_are_closed_and_fresh_ones_kept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let (_, write_half) = server.into_split();
        let (session, _writer) =
            Session::start(1, client.local_addr().expect("peer"), write_half, 4);

        let registry = Arc::new(ConnectionRegistry::new());
        registry.add(std::sync::Arc::clone(&session));

        let supervisor = spawn(
            Arc::clone(&registry),
            HeartbeatConfig {
                enabled: true,
                interval_secs: 1,
                timeout_secs: 0,
            },
        );

        // idle_secs must exceed the zero timeout, so wait out one second.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        for _ in 0..20 {
            if session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(session.is_closed());
        supervisor.abort();
    }
}
