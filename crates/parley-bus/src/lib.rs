//! Durable pub/sub bus capability for cross-node delivery.
//!
//! Subjects follow `chat.p2p.<user_uuid>`, `chat.group.<group_id>`, and
//! `system.<event>`. Delivery is at-least-once: subscriptions are durable
//! per `(subject, consumer name)` and resume from the last acked sequence.
//! Publishers never see subscriber failures; broker-side retention covers
//! retry. Subscribers are responsible for dropping their own publications
//! by comparing `source_node`.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("subscription already exists for {subject} as {durable}")]
    DuplicateSubscription { subject: String, durable: String },
}

pub mod subjects {
    //! Subject naming. Everything cross-node goes through these three
    //! families; the wildcard forms are what the broker streams bind.

    pub const CHAT_WILDCARD: &str = "chat.>";
    pub const SYSTEM_WILDCARD: &str = "system.>";

    pub fn p2p(user_uuid: &str) -> String {
        format!("chat.p2p.{user_uuid}")
    }

    pub fn group(group_id: u64) -> String {
        format!("chat.group.{group_id}")
    }

    pub fn system(event: &str) -> String {
        format!("system.{event}")
    }
}

/// Durable consumer names, unique per `(target, node)` so a restarted node
/// resumes its own cursor.
pub mod durable {
    pub fn user(user_uuid: &str, node_id: &str) -> String {
        format!("user_{user_uuid}_{node_id}")
    }

    pub fn group(group_id: u64, node_id: &str) -> String {
        format!("group_{group_id}_{node_id}")
    }
}

/// Retention profile a broker deployment applies to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub name: &'static str,
    pub subjects: &'static str,
    pub in_memory: bool,
    pub max_age: Duration,
    pub replicas: usize,
}

/// Chat traffic: in-memory, 24 h retention.
pub const CHAT_MESSAGES: StreamProfile = StreamProfile {
    name: "CHAT_MESSAGES",
    subjects: subjects::CHAT_WILDCARD,
    in_memory: true,
    max_age: Duration::from_secs(24 * 60 * 60),
    replicas: 3,
};

/// System events: persistent, 7 d retention.
pub const SYSTEM_EVENTS: StreamProfile = StreamProfile {
    name: "SYSTEM_EVENTS",
    subjects: subjects::SYSTEM_WILDCARD,
    in_memory: false,
    max_age: Duration::from_secs(7 * 24 * 60 * 60),
    replicas: 3,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnvelopeKind {
    #[serde(rename = "p2p_message")]
    P2p,
    #[serde(rename = "group_message")]
    Group,
}

/// Wrapper published for every cross-node chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrossNodeEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub target_id: String,
    pub source_node: String,
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
    pub timestamp: i64,
}

impl CrossNodeEnvelope {
    pub fn new(kind: EnvelopeKind, target_id: &str, source_node: &str, payload: Bytes) -> Self {
        Self {
            kind,
            target_id: target_id.to_string(),
            source_node: source_node.to_string(),
            payload,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64,
        }
    }

    pub fn encode(&self) -> Bytes {
        // Infallible for this shape; the fields are strings and bytes.
        Bytes::from(serde_json::to_vec(self).expect("envelope encode"))
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
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

/// One delivered message. Ack it through the subscription that yielded it.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
    pub seq: u64,
}

/// Handle to a durable subscription. Dropping it stops delivery but keeps
/// the durable cursor, so a re-subscribe under the same name resumes.
#[derive(Debug)]
pub struct BusSubscription {
    rx: mpsc::Receiver<BusMessage>,
    acks: mpsc::UnboundedSender<u64>,
    forwarder: JoinHandle<()>,
    durables: Arc<StdMutex<Durables>>,
    key: (String, String),
}

impl BusSubscription {
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Mark a message consumed; the durable cursor advances past it.
    pub fn ack(&self, message: &BusMessage) {
        let _ = self.acks.send(message.seq);
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
        // Release the consumer name; the cursor stays for resumption.
        self.durables
            .lock()
            .expect("durables lock")
            .active
            .remove(&self.key);
    }
}

#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish; broker durability covers delivery.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
    /// Open (or resume) the durable subscription `durable` on `subject`.
    async fn subscribe(&self, subject: &str, durable: &str) -> Result<BusSubscription>;
    /// Tear the consumer down and forget its cursor.
    async fn unsubscribe(&self, subject: &str, durable: &str) -> Result<()>;
}

const LOG_CAPACITY: usize = 1024;
const DELIVERY_QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
struct SubjectState {
    // Live fanout for attached subscribers.
    live: broadcast::Sender<BusMessage>,
    // Bounded replay log; oldest entries drop as new ones arrive.
    log: Mutex<SubjectLog>,
}

#[derive(Debug)]
struct SubjectLog {
    entries: VecDeque<BusMessage>,
    next_seq: u64,
}

impl SubjectState {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LOG_CAPACITY);
        Self {
            live,
            log: Mutex::new(SubjectLog {
                entries: VecDeque::new(),
                next_seq: 1,
            }),
        }
    }
}

#[derive(Default)]
#[derive(Debug)]
struct Durables {
    // (subject, durable) -> highest acked seq.
    cursors: HashMap<(String, String), u64>,
    active: std::collections::HashSet<(String, String)>,
}

/// In-process [`MessageBus`]: per-subject broadcast plus a bounded replay
/// log, with durable cursors per consumer name. Node instances in one
/// process (or one test) share a single `Arc<InProcessBus>`, which is the
/// same topology a broker cluster provides.
pub struct InProcessBus {
    subjects: RwLock<HashMap<String, Arc<SubjectState>>>,
    durables: Arc<StdMutex<Durables>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            subjects: RwLock::new(HashMap::new()),
            durables: Arc::new(StdMutex::new(Durables::default())),
        }
    }

    async fn subject(&self, subject: &str) -> Arc<SubjectState> {
        if let Some(state) = self.subjects.read().await.get(subject) {
            return Arc::clone(state);
        }
        let mut guard = self.subjects.write().await;
        Arc::clone(
            guard
                .entry(subject.to_string())
                .or_insert_with(|| Arc::new(SubjectState::new())),
        )
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let state = self.subject(subject).await;
        let mut log = state.log.lock().await;
        let seq = log.next_seq;
        log.next_seq += 1;
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            seq,
        };
        log.entries.push_back(message.clone());
        while log.entries.len() > LOG_CAPACITY {
            log.entries.pop_front();
        }
        drop(log);
        // No receivers is fine; the log still retains the message.
        let _ = state.live.send(message);
        Ok(())
    }

    async fn subscribe(&self, subject: &str, durable: &str) -> Result<BusSubscription> {
        let key = (subject.to_string(), durable.to_string());
        let acked = {
            let mut durables = self.durables.lock().expect("durables lock");
            if durables.active.contains(&key) {
                return Err(BusError::DuplicateSubscription {
                    subject: subject.to_string(),
                    durable: durable.to_string(),
                });
            }
            durables.active.insert(key.clone());
            durables.cursors.get(&key).copied().unwrap_or(0)
        };

        let state = self.subject(subject).await;

        // Snapshot the backlog and attach to the live feed under the log
        // lock so nothing published in between is missed or duplicated.
        let log = state.log.lock().await;
        let backlog: Vec<BusMessage> = log
            .entries
            .iter()
            .filter(|message| message.seq > acked)
            .cloned()
            .collect();
        let live_rx = state.live.subscribe();
        drop(log);

        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(run_forwarder(
            backlog,
            live_rx,
            tx,
            ack_rx,
            Arc::clone(&self.durables),
            key.clone(),
        ));

        Ok(BusSubscription {
            rx,
            acks: ack_tx,
            forwarder,
            durables: Arc::clone(&self.durables),
            key,
        })
    }

    async fn unsubscribe(&self, subject: &str, durable: &str) -> Result<()> {
        let key = (subject.to_string(), durable.to_string());
        let mut durables = self.durables.lock().expect("durables lock");
        durables.active.remove(&key);
        durables.cursors.remove(&key);
        Ok(())
    }
}

async fn run_forwarder(
    backlog: Vec<BusMessage>,
    mut live_rx: broadcast::Receiver<BusMessage>,
    tx: mpsc::Sender<BusMessage>,
    mut ack_rx: mpsc::UnboundedReceiver<u64>,
    durables: Arc<StdMutex<Durables>>,
    key: (String, String),
) {
    let mut last_forwarded = 0u64;
    for message in backlog {
        last_forwarded = message.seq;
        if tx.send(message).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            ack = ack_rx.recv() => {
                match ack {
                    Some(seq) => {
                        let mut guard = durables.lock().expect("durables lock");
                        let cursor = guard.cursors.entry(key.clone()).or_insert(0);
                        *cursor = (*cursor).max(seq);
                    }
                    None => return,
                }
            }
            live = live_rx.recv() => {
                match live {
                    // The backlog snapshot may overlap the live feed.
                    Ok(message) if message.seq > last_forwarded => {
                        last_forwarded = message.seq;
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, subject = %key.0, durable = %key.1,
                            "bus subscriber lagged; continuing from live feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}
