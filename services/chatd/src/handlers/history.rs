//! History and chat-relation queries.
use crate::AppContext;
use crate::dispatch::Handler;
use crate::error::ChatError;
use crate::session::Session;
use crate::store::{DirectoryStore as _, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::{HistoryMsgReq, HistoryRecord, StatusEnvelope, TextMsg, msg_id};
use parley_storage::MessageStore as _;
use std::sync::Arc;

fn status_error(err: &ChatError) -> Bytes {
    let body: StatusEnvelope<serde_json::Value> =
        StatusEnvelope::err(err.wire_code(), err.wire_message());
    Bytes::from(serde_json::to_vec(&body).expect("envelope encode"))
}

pub struct HistoryMsgHandler;

#[async_trait]
impl Handler for HistoryMsgHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::HISTORY_MSG_RESP
    }

    fn render_error(&self, err: &ChatError) -> Bytes {
        status_error(err)
    }

    async fn handle(
        &self,
        ctx: &AppContext,
        session: &Arc<Session>,
        payload: Bytes,
    ) -> Result<(), ChatError> {
        let identity = session.identity().ok_or(ChatError::Unauthenticated)?;
        let req: HistoryMsgReq = serde_json::from_slice(&payload)?;
        let target = match ctx.services.directory.user_by_uuid(&req.target_user_uuid).await {
            Ok(user) => user,
            Err(StoreError::NotFound(_)) => return Err(ChatError::RecipientUnknown),
            Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
        };

        let envelopes = ctx
            .services
            .messages
            .history(identity.user_id, target.id, req.limit)
            .await?;
        let records: Vec<HistoryRecord> = envelopes
            .into_iter()
            .filter_map(|envelope| {
                // The stored payload is the routed frame body; anything that
                // does not parse as one is rejected rather than guessed at.
                match serde_json::from_slice::<TextMsg>(&envelope.data) {
                    Ok(msg) => Some(HistoryRecord {
                        from_user_id: envelope.from_user_id,
                        content: msg.content,
                        timestamp: envelope.timestamp,
                    }),
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping malformed history envelope");
                        None
                    }
                }
            })
            .collect();

        let body = StatusEnvelope::ok("history", records);
        session
            .send_json(msg_id::HISTORY_MSG_RESP, &body)
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}

pub struct ChatRelationHandler;

#[async_trait]
impl Handler for ChatRelationHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::CHAT_RELATION_RESP
    }

    fn render_error(&self, err: &ChatError) -> Bytes {
        status_error(err)
    }

    async fn handle(
        &self,
        ctx: &AppContext,
        session: &Arc<Session>,
        _payload: Bytes,
    ) -> Result<(), ChatError> {
        let identity = session.identity().ok_or(ChatError::Unauthenticated)?;
        let relations = ctx.services.messages.relations(identity.user_id).await?;
        let body = StatusEnvelope::ok("relations", relations);
        session
            .send_json(msg_id::CHAT_RELATION_RESP, &body)
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}
