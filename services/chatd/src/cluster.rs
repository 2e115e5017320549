//! Cluster coordination: per-user and per-group bus subscriptions tied to
//! online/offline transitions, presence writes, node lifecycle events, and
//! the 30-second cluster heartbeat.
//!
//! Subscription lifecycle invariant: a node holds the `chat.p2p.<uuid>`
//! subscription for exactly the users bound to it, and a `chat.group.<id>`
//! subscription while at least one local user belongs to that group.
use crate::Services;
use crate::error::Result;
use crate::routing;
use crate::store::DirectoryStore as _;
use bytes::Bytes;
use parley_bus::{BusError, BusSubscription, CrossNodeEnvelope, MessageBus as _, durable, subjects};
use parley_presence::PresenceRegistry as _;
use parley_storage::MessageStore as _;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const CLUSTER_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Default)]
struct CoordState {
    user_tasks: HashMap<u64, JoinHandle<()>>,
    user_uuids: HashMap<u64, String>,
    group_tasks: HashMap<u64, JoinHandle<()>>,
    group_locals: HashMap<u64, HashSet<u64>>,
    lifecycle_tasks: Vec<JoinHandle<()>>,
}

pub struct Coordinator {
    services: Arc<Services>,
    state: Mutex<CoordState>,
}

impl Coordinator {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            state: Mutex::new(CoordState::default()),
        }
    }

    /// Node start: discovery registration, peer watch, started event, and
    /// the periodic cluster heartbeat.
    pub async fn start(&self) -> Result<()> {
        self.services
            .presence
            .register_node(&self.services.node_id)
            .await?;

        let mut watch = self.services.presence.watch();
        let watch_task = tokio::spawn(async move {
            while let Ok(event) = watch.recv().await {
                tracing::info!(?event, "chat node membership changed");
            }
        });

        let services = Arc::clone(&self.services);
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLUSTER_HEARTBEAT_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let body = serde_json::json!({
                    "node_id": services.node_id,
                    "now": now_unix(),
                    "active_user_count": services.registry.bound_users(),
                    "status": "ok",
                });
                if let Err(err) = services
                    .bus
                    .publish(&subjects::system("heartbeat"), Bytes::from(body.to_string()))
                    .await
                {
                    tracing::warn!(error = %err, "cluster heartbeat publish failed");
                }
            }
        });

        {
            let mut state = self.state.lock().await;
            state.lifecycle_tasks.push(watch_task);
            state.lifecycle_tasks.push(heartbeat_task);
        }

        self.publish_system_event("server_started", serde_json::json!({
            "server_id": self.services.node_id,
        }))
        .await;
        tracing::info!(node_id = %self.services.node_id, "coordinator started");
        Ok(())
    }

    /// Node stop: announce, clear every tracked user's presence, tear down
    /// subscriptions, and leave discovery.
    pub async fn stop(&self) {
        self.publish_system_event("server_stopping", serde_json::json!({
            "server_id": self.services.node_id,
        }))
        .await;

        let mut state = self.state.lock().await;
        let drained_user_tasks: Vec<_> = state.user_tasks.drain().collect();
        for (user_id, task) in drained_user_tasks {
            task.abort();
            if let Some(uuid) = state.user_uuids.remove(&user_id)
                && let Err(err) = self.services.presence.set_offline(&uuid).await
            {
                tracing::warn!(user_id, error = %err, "presence clear failed on stop");
            }
        }
        for (_, task) in state.group_tasks.drain() {
            task.abort();
        }
        state.group_locals.clear();
        for task in state.lifecycle_tasks.drain(..) {
            task.abort();
        }
        drop(state);

        if let Err(err) = self
            .services
            .presence
            .deregister_node(&self.services.node_id)
            .await
        {
            tracing::warn!(error = %err, "discovery deregistration failed");
        }
        tracing::info!(node_id = %self.services.node_id, "coordinator stopped");
    }

    /// Login-time transition: subscribe to the user's p2p subject, mark
    /// presence, announce, and pick up group subscriptions.
    pub async fn handle_user_online(&self, user_id: u64, user_uuid: &str) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.user_tasks.contains_key(&user_id) {
                return Ok(());
            }
        }

        let subject = subjects::p2p(user_uuid);
        let consumer = durable::user(user_uuid, &self.services.node_id);
        match self.services.bus.subscribe(&subject, &consumer).await {
            Ok(subscription) => {
                let task = spawn_p2p_consumer(Arc::clone(&self.services), subscription);
                let mut state = self.state.lock().await;
                state.user_tasks.insert(user_id, task);
                state.user_uuids.insert(user_id, user_uuid.to_string());
            }
            // A racing login on this node already owns the consumer.
            Err(BusError::DuplicateSubscription { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        self.services
            .presence
            .set_online(user_uuid, &self.services.node_id)
            .await?;
        self.publish_system_event("user_online", serde_json::json!({
            "user_uuid": user_uuid,
            "server_id": self.services.node_id,
        }))
        .await;

        match self.services.directory.user_groups(user_id).await {
            Ok(groups) => {
                for group in groups {
                    self.track_group_member(group.id, user_id).await;
                }
            }
            Err(err) => {
                tracing::warn!(user_id, error = %err, "group subscriptions skipped");
            }
        }
        tracing::info!(user_id, user_uuid, "user online on this node");
        Ok(())
    }

    /// Logout / close-time transition; the inverse of `handle_user_online`.
    /// A user not tracked on this node (already logged out, or displaced
    /// and rebound) is a no-op, so close paths can all call this safely.
    pub async fn handle_user_offline(&self, user_id: u64, user_uuid: &str) {
        let groups: Vec<u64> = {
            let mut state = self.state.lock().await;
            let Some(task) = state.user_tasks.remove(&user_id) else {
                return;
            };
            task.abort();
            state.user_uuids.remove(&user_id);
            state
                .group_locals
                .iter()
                .filter(|(_, members)| members.contains(&user_id))
                .map(|(group_id, _)| *group_id)
                .collect()
        };
        for group_id in groups {
            self.untrack_group_member(group_id, user_id).await;
        }

        let subject = subjects::p2p(user_uuid);
        let consumer = durable::user(user_uuid, &self.services.node_id);
        if let Err(err) = self.services.bus.unsubscribe(&subject, &consumer).await {
            tracing::warn!(user_id, error = %err, "p2p unsubscribe failed");
        }
        if let Err(err) = self.services.presence.set_offline(user_uuid).await {
            tracing::warn!(user_id, error = %err, "presence clear failed");
        }
        if let Err(err) = self.services.directory.mark_offline(user_id).await {
            tracing::warn!(user_id, error = %err, "directory offline mark failed");
        }
        self.publish_system_event("user_offline", serde_json::json!({
            "user_uuid": user_uuid,
            "server_id": self.services.node_id,
        }))
        .await;
        tracing::info!(user_id, user_uuid, "user offline on this node");
    }

    /// Track a local member of a group, subscribing to the group subject on
    /// the first one.
    pub async fn track_group_member(&self, group_id: u64, user_id: u64) {
        let mut state = self.state.lock().await;
        state
            .group_locals
            .entry(group_id)
            .or_default()
            .insert(user_id);
        if state.group_tasks.contains_key(&group_id) {
            return;
        }
        let subject = subjects::group(group_id);
        let consumer = durable::group(group_id, &self.services.node_id);
        match self.services.bus.subscribe(&subject, &consumer).await {
            Ok(subscription) => {
                let task = spawn_group_consumer(Arc::clone(&self.services), subscription);
                state.group_tasks.insert(group_id, task);
            }
            Err(BusError::DuplicateSubscription { .. }) => {}
            Err(err) => {
                tracing::warn!(group_id, error = %err, "group subscribe failed");
            }
        }
    }

    /// Drop a local member; the last one releases the group subscription.
    pub async fn untrack_group_member(&self, group_id: u64, user_id: u64) {
        let release = {
            let mut state = self.state.lock().await;
            let empty = match state.group_locals.get_mut(&group_id) {
                Some(members) => {
                    members.remove(&user_id);
                    members.is_empty()
                }
                None => false,
            };
            if empty {
                state.group_locals.remove(&group_id);
                if let Some(task) = state.group_tasks.remove(&group_id) {
                    task.abort();
                }
            }
            empty
        };
        if release {
            let subject = subjects::group(group_id);
            let consumer = durable::group(group_id, &self.services.node_id);
            if let Err(err) = self.services.bus.unsubscribe(&subject, &consumer).await {
                tracing::warn!(group_id, error = %err, "group unsubscribe failed");
            }
        }
    }

    /// Teardown for a closing connection; displaced connections were
    /// already unbound and skip this.
    pub async fn handle_conn_stop(&self, user_id: u64, user_uuid: &str) {
        self.handle_user_offline(user_id, user_uuid).await;
    }

    /// Replay drained offline envelopes to a freshly logged-in session,
    /// deduplicating identical payloads within the batch.
    pub async fn replay_offline(&self, session: &crate::session::Session, user_id: u64) {
        let envelopes = match self.services.messages.drain_offline(user_id).await {
            Ok(envelopes) => envelopes,
            Err(err) => {
                tracing::warn!(user_id, error = %err, "offline drain failed");
                return;
            }
        };
        if envelopes.is_empty() {
            return;
        }
        tracing::info!(user_id, count = envelopes.len(), "replaying offline messages");
        let mut seen: HashSet<Bytes> = HashSet::new();
        for envelope in envelopes {
            if !seen.insert(envelope.data.clone()) {
                continue;
            }
            if let Err(err) = session.send(parley_proto::msg_id::TEXT_MSG, envelope.data) {
                tracing::warn!(user_id, error = %err, "offline replay interrupted");
                return;
            }
        }
    }

    async fn publish_system_event(&self, event: &str, body: serde_json::Value) {
        if let Err(err) = self
            .services
            .bus
            .publish(&subjects::system(event), Bytes::from(body.to_string()))
            .await
        {
            tracing::warn!(event, error = %err, "system event publish failed");
        }
    }
}

fn spawn_p2p_consumer(services: Arc<Services>, mut subscription: BusSubscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = subscription.next().await {
            match CrossNodeEnvelope::decode(&message.payload) {
                Ok(envelope) => {
                    // Suppress echoes of our own publications.
                    if envelope.source_node != services.node_id {
                        routing::p2p::deliver_inbound(&services, &envelope).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(subject = %message.subject, error = %err, "bad p2p envelope");
                }
            }
            subscription.ack(&message);
        }
    })
}

fn spawn_group_consumer(
    services: Arc<Services>,
    mut subscription: BusSubscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = subscription.next().await {
            match CrossNodeEnvelope::decode(&message.payload) {
                Ok(envelope) => {
                    if envelope.source_node != services.node_id {
                        routing::group::deliver_inbound(&services, &envelope).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(subject = %message.subject, error = %err, "bad group envelope");
                }
            }
            subscription.ack(&message);
        }
    })
}
