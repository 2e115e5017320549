//! Per-connection session state and the single-writer outbound path.
//!
//! Every connection gets exactly one writer task consuming a bounded queue;
//! `send` from any number of producers enqueues a complete frame, so writes
//! observed by the peer are always a prefix of the frames issued in program
//! order. A full queue is a slow consumer and closes the session.
use bytes::Bytes;
use parley_wire::Frame;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("payload encode failed: {0}")]
    Encode(String),
}

/// Identity attached exactly once, at successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: u64,
    pub user_uuid: String,
    pub username: String,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct Session {
    conn_id: u64,
    peer: SocketAddr,
    identity: RwLock<Option<Identity>>,
    // Open-ended string tags; identity never goes through here.
    tags: RwLock<HashMap<String, String>>,
    last_seen: AtomicI64,
    outbound: mpsc::Sender<Frame>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Session {
    /// Create the session and its writer task over the write half.
    pub fn start(
        conn_id: u64,
        peer: SocketAddr,
        write_half: OwnedWriteHalf,
        queue_len: usize,
    ) -> (std::sync::Arc<Self>, JoinHandle<()>) {
        let (outbound, rx) = mpsc::channel(queue_len.max(1));
        let session = std::sync::Arc::new(Self {
            conn_id,
            peer,
            identity: RwLock::new(None),
            tags: RwLock::new(HashMap::new()),
            last_seen: AtomicI64::new(now_unix()),
            outbound,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        let writer = tokio::spawn(run_writer(rx, write_half, std::sync::Arc::clone(&session)));
        (session, writer)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue one frame for the writer task. `Closed` when the connection is
    /// gone; a full queue evicts the slow consumer and also reports
    /// `Closed`.
    pub fn send(&self, msg_id: u32, payload: Bytes) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match self.outbound.try_send(Frame::new(msg_id, payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn_id = self.conn_id, "outbound queue full, evicting slow consumer");
                self.close();
                Err(SessionError::Closed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    pub fn send_json<T: Serialize>(&self, msg_id: u32, value: &T) -> Result<(), SessionError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| SessionError::Encode(err.to_string()))?;
        self.send(msg_id, Bytes::from(payload))
    }

    /// Record inbound activity; any frame counts, not only pings.
    pub fn touch(&self) {
        self.last_seen.store(now_unix(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn idle_secs(&self) -> i64 {
        (now_unix() - self.last_seen()).max(0)
    }

    pub fn authenticate(&self, identity: Identity) {
        *self.identity.write().expect("identity lock") = Some(identity);
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().expect("identity lock").clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.read().expect("identity lock").is_some()
    }

    pub fn set_tag(&self, key: &str, value: &str) {
        self.tags
            .write()
            .expect("tags lock")
            .insert(key.to_string(), value.to_string());
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags.read().expect("tags lock").get(key).cloned()
    }

    /// Idempotent close. The writer drains already-queued frames (so a
    /// response written just before close still goes out) and shuts the
    /// socket down.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once the session is closed; safe against lost wakeups.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<Frame>,
    mut write_half: OwnedWriteHalf,
    session: std::sync::Arc<Session>,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(frame) => {
                        if let Err(err) = parley_wire::write_frame(&mut write_half, &frame).await {
                            tracing::debug!(conn_id = session.conn_id, error = %err, "outbound write failed");
                            session.close();
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = session.wait_closed() => {
                // Flush frames queued before the close, then stop.
                while let Ok(frame) = rx.try_recv() {
                    if parley_wire::write_frame(&mut write_half, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_proto::msg_id;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn pipe() -> (OwnedWriteHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let (_, write_half) = server.into_split();
        (write_half, client)
    }

    #[tokio::test]
    async fn send_frames_arrive_in_order() {
        let (write_half, mut client) = pipe().await;
        let (session, writer) = Session::start(1, client.local_addr().expect("peer"), write_half, 16);

        session.send(msg_id::PONG, Bytes::from_static(b"pong")).expect("send");
        session
            .send(msg_id::TEXT_MSG, Bytes::from_static(b"{}"))
            .expect("send");

        let first = parley_wire::read_frame(&mut client, 1024)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(first.msg_id, msg_id::PONG);
        let second = parley_wire::read_frame(&mut client, 1024)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(second.msg_id, msg_id::TEXT_MSG);

        session.close();
        writer.await.expect("writer");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_flushes_queued_frames() {
        let (write_half, mut client) = pipe().await;
        let (session, writer) = Session::start(1, client.local_addr().expect("peer"), write_half, 16);

        session
            .send(msg_id::LOGOUT_RESP, Bytes::from_static(b"{\"code\":0,\"msg\":\"bye\"}"))
            .expect("send");
        session.close();
        session.close();

        let frame = parley_wire::read_frame(&mut client, 1024)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(frame.msg_id, msg_id::LOGOUT_RESP);
        // EOF after the flush.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.expect("eof");
        assert!(rest.is_empty());

        assert_eq!(
            session.send(msg_id::PONG, Bytes::new()),
            Err(SessionError::Closed)
        );
        writer.await.expect("writer");
    }

    #[tokio::test]
    async fn full_queue_evicts_the_session() {
        let (write_half, client) = pipe().await;
        // Queue depth 1 and no reader draining the socket buffer fast
        // enough: the second enqueue while the writer is busy can fill it.
        let (session, _writer) = Session::start(1, client.local_addr().expect("peer"), write_half, 1);
        let mut evicted = false;
        for _ in 0..64 {
            if session
                .send(msg_id::TEXT_MSG, Bytes::from(vec![0u8; 1024]))
                .is_err()
            {
                evicted = true;
                break;
            }
        }
        // Either the writer kept up (all sends fine) or the session closed;
        // after a close every send reports Closed.
        if evicted {
            assert!(session.is_closed());
            assert_eq!(
                session.send(msg_id::PONG, Bytes::new()),
                Err(SessionError::Closed)
            );
        }
        drop(client);
    }

    #[tokio::test]
    async fn identity_attaches_once() {
        let (write_half, client) = pipe().await;
        let (session, _writer) = Session::start(9, client.local_addr().expect("peer"), write_half, 4);
        assert!(!session.is_authenticated());
        session.authenticate(Identity {
            user_id: 3,
            user_uuid: "u-3".into(),
            username: "carol".into(),
        });
        assert!(session.is_authenticated());
        assert_eq!(session.identity().expect("identity").username, "carol");
        session.set_tag("client", "cli/1.0");
        assert_eq!(session.tag("client").as_deref(), Some("cli/1.0"));
        assert_eq!(session.tag("missing"), None);
    }
}
