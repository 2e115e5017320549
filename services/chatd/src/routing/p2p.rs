//! Point-to-point routing.
//!
//! Outbound decision tree, in order: resolve the recipient, try the local
//! registry, then consult presence for a cross-node publish, and fall back
//! to the offline queue. History is written on every path that accepts the
//! message; the offline queue only when no live delivery happened. On the
//! subscriber side, a bus envelope either reaches a local session or lands
//! offline-only, because the sending node already wrote history.
use crate::Services;
use crate::error::{ChatError, Result};
use crate::session::Identity;
use crate::store::{DirectoryStore as _, StoreError, User};
use bytes::Bytes;
use parley_bus::{CrossNodeEnvelope, EnvelopeKind, MessageBus as _, subjects};
use parley_presence::{Location, PresenceRegistry as _};
use parley_proto::{TextMsg, msg_id};
use parley_storage::MessageStore as _;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Resolve a recipient string as UUID, then username, then numeric id.
async fn resolve_recipient(services: &Services, to: &str) -> Result<Option<User>> {
    match services.directory.user_by_uuid(to).await {
        Ok(user) => return Ok(Some(user)),
        Err(StoreError::NotFound(_)) => {}
        Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
    }
    match services.directory.user_by_username(to).await {
        Ok(user) => return Ok(Some(user)),
        Err(StoreError::NotFound(_)) => {}
        Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
    }
    if let Ok(id) = to.parse::<u64>() {
        match services.directory.user_by_id(id).await {
            Ok(user) => return Ok(Some(user)),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
        }
    }
    Ok(None)
}

/// Route one message from an authenticated sender. `deliver_msg_id` is the
/// inbound frame's id so image and file payloads keep their kind on
/// delivery.
pub async fn route(
    services: &Services,
    from: &Identity,
    deliver_msg_id: u32,
    mut msg: TextMsg,
) -> Result<()> {
    // Stamp the sender identity and time before anything else sees it.
    msg.from_user_id = Some(from.user_uuid.clone());
    msg.sent_at = Some(now_unix());
    let payload = Bytes::from(serde_json::to_vec(&msg)?);

    let Some(recipient) = resolve_recipient(services, &msg.to_user_id).await? else {
        tracing::info!(to = %msg.to_user_id, "recipient did not resolve");
        return Err(ChatError::RecipientUnknown);
    };

    // Local probe first; a hit skips presence and the bus entirely.
    if let Some(session) = services.registry.by_user_id(recipient.id) {
        if session.send(deliver_msg_id, payload.clone()).is_ok() {
            services
                .messages
                .save_history_only(from.user_id, recipient.id, payload)
                .await?;
            tracing::debug!(from = from.user_id, to = recipient.id, "delivered locally");
            return Ok(());
        }
        // A failed local send demotes to offline + history, never to the bus.
        tracing::warn!(to = recipient.id, "local send failed, storing offline");
        services
            .messages
            .save_message(from.user_id, recipient.id, payload)
            .await?;
        return Ok(());
    }

    match services.presence.get_server(&recipient.user_uuid).await? {
        Location::Node(node) if node != services.node_id => {
            // Remote delivery: the subscriber owns local fan-in; broker
            // durability covers transient failures, so no offline write.
            let envelope = CrossNodeEnvelope::new(
                EnvelopeKind::P2p,
                &recipient.user_uuid,
                &services.node_id,
                payload.clone(),
            );
            if let Err(err) = services
                .bus
                .publish(&subjects::p2p(&recipient.user_uuid), envelope.encode())
                .await
            {
                tracing::warn!(to = %recipient.user_uuid, error = %err, "p2p publish failed");
            }
            services
                .messages
                .save_history_only(from.user_id, recipient.id, payload)
                .await?;
            tracing::debug!(from = from.user_id, to = recipient.id, node = %node, "published cross-node");
        }
        _ => {
            // Not online anywhere (a stale self record counts as offline).
            services
                .messages
                .save_message(from.user_id, recipient.id, payload)
                .await?;
            tracing::debug!(from = from.user_id, to = recipient.id, "stored offline");
        }
    }
    Ok(())
}

/// Subscriber side: deliver a bus envelope to a local session, or enqueue
/// offline when the user left between presence probe and delivery. The
/// caller has already dropped self-echoes by `source_node`.
pub async fn deliver_inbound(services: &Services, envelope: &CrossNodeEnvelope) {
    let target = match services.directory.user_by_uuid(&envelope.target_id).await {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(target = %envelope.target_id, error = %err, "inbound target unknown");
            return;
        }
    };

    if let Some(session) = services.registry.by_user_id(target.id)
        && session.send(msg_id::TEXT_MSG, envelope.payload.clone()).is_ok()
    {
        tracing::debug!(to = target.id, "bus message delivered locally");
        return;
    }

    // The user moved or dropped; park the payload in their offline queue.
    // History already exists on the sending node's write.
    let sender_id = match serde_json::from_slice::<TextMsg>(&envelope.payload) {
        Ok(msg) => match msg.from_user_id.as_deref() {
            Some(uuid) => services
                .directory
                .user_by_uuid(uuid)
                .await
                .map(|user| user.id)
                .unwrap_or(0),
            None => 0,
        },
        Err(_) => 0,
    };
    if let Err(err) = services
        .messages
        .save_offline_only(sender_id, target.id, envelope.payload.clone())
        .await
    {
        tracing::error!(to = target.id, error = %err, "offline store failed for bus message");
    }
}
