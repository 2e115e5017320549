//! Group routing: membership gate, persistence, local fan-out, and the
//! cross-node publish. Fan-out is best effort per member; one broken
//! session never aborts the loop.
use crate::Services;
use crate::session::Identity;
use crate::store::DirectoryStore as _;
use bytes::Bytes;
use parley_bus::{CrossNodeEnvelope, EnvelopeKind, MessageBus as _, subjects};
use parley_proto::{GroupTextMsgPush, GroupTextMsgReq, GroupTextMsgResp, group_status, msg_id};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn status(status: u32, error: &str) -> GroupTextMsgResp {
    GroupTextMsgResp {
        status,
        msg_id: None,
        error: Some(error.to_string()),
    }
}

/// Route one group text message; the returned response goes back to the
/// sender on the response id, success or not.
pub async fn route(services: &Services, from: &Identity, req: GroupTextMsgReq) -> GroupTextMsgResp {
    let member = match services.directory.is_member(req.group_id, from.user_id).await {
        Ok(member) => member,
        Err(err) => {
            tracing::warn!(group = req.group_id, error = %err, "membership check failed");
            return status(group_status::MEMBERSHIP_CHECK_FAILED, "membership check failed");
        }
    };
    if !member {
        return status(group_status::NOT_A_MEMBER, "not a member of this group");
    }

    let member_ids = match services.directory.member_ids(req.group_id).await {
        Ok(ids) => ids,
        Err(err) => {
            tracing::warn!(group = req.group_id, error = %err, "member list fetch failed");
            return status(group_status::MEMBER_FETCH_FAILED, "member list fetch failed");
        }
    };

    // Persist before fan-out so the ack can carry the message id. A store
    // failure is logged and the fan-out still proceeds.
    let stored_msg_id = match services
        .directory
        .save_group_message(
            req.group_id,
            from.user_id,
            &from.user_uuid,
            &from.username,
            &req.content,
            "text",
        )
        .await
    {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!(group = req.group_id, error = %err, "group message persist failed");
            None
        }
    };

    let push = GroupTextMsgPush {
        group_id: req.group_id,
        from_user_id: from.user_id,
        from_user_uuid: from.user_uuid.clone(),
        from_username: from.username.clone(),
        content: req.content.clone(),
        timestamp: now_unix(),
    };
    let push_bytes = match serde_json::to_vec(&push) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            tracing::error!(group = req.group_id, error = %err, "push encode failed");
            return status(group_status::MARSHAL_ERROR, "internal error preparing message");
        }
    };

    let mut notified = 0usize;
    for member_id in &member_ids {
        if *member_id == from.user_id {
            continue;
        }
        if let Some(session) = services.registry.by_user_id(*member_id) {
            match session.send(msg_id::GROUP_TEXT_MSG_PUSH, push_bytes.clone()) {
                Ok(()) => notified += 1,
                Err(err) => {
                    tracing::warn!(group = req.group_id, member = member_id, error = %err,
                        "group push failed");
                }
            }
        }
    }
    tracing::debug!(group = req.group_id, notified, "group fan-out complete");

    // Other nodes fan out to their own local members.
    let envelope = CrossNodeEnvelope::new(
        EnvelopeKind::Group,
        &req.group_id.to_string(),
        &services.node_id,
        push_bytes,
    );
    if let Err(err) = services
        .bus
        .publish(&subjects::group(req.group_id), envelope.encode())
        .await
    {
        tracing::warn!(group = req.group_id, error = %err, "group publish failed");
    }

    GroupTextMsgResp {
        status: group_status::OK,
        msg_id: stored_msg_id,
        error: None,
    }
}

/// Subscriber side of a group envelope: fan out to local members,
/// excluding the original sender in case they also sit on this node.
pub async fn deliver_inbound(services: &Services, envelope: &CrossNodeEnvelope) {
    let push: GroupTextMsgPush = match serde_json::from_slice(&envelope.payload) {
        Ok(push) => push,
        Err(err) => {
            tracing::warn!(error = %err, "bad group envelope payload");
            return;
        }
    };
    let member_ids = match services.directory.member_ids(push.group_id).await {
        Ok(ids) => ids,
        Err(err) => {
            tracing::warn!(group = push.group_id, error = %err, "member list fetch failed");
            return;
        }
    };
    for member_id in member_ids {
        if member_id == push.from_user_id {
            continue;
        }
        if let Some(session) = services.registry.by_user_id(member_id)
            && let Err(err) = session.send(msg_id::GROUP_TEXT_MSG_PUSH, envelope.payload.clone())
        {
            tracing::warn!(group = push.group_id, member = member_id, error = %err,
                "group push failed");
        }
    }
}
