//! Group chat handler. Unlike the other endpoints this one answers with a
//! status-coded response on success and failure alike; only parse errors
//! reach the dispatcher's error path.
use crate::AppContext;
use crate::dispatch::Handler;
use crate::error::ChatError;
use crate::routing;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::{GroupTextMsgReq, GroupTextMsgResp, group_status, msg_id};
use std::sync::Arc;

pub struct GroupTextMsgHandler;

#[async_trait]
impl Handler for GroupTextMsgHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::GROUP_TEXT_MSG_RESP
    }

    fn render_error(&self, err: &ChatError) -> Bytes {
        let status = match err {
            ChatError::InvalidFormat(_) => group_status::INVALID_FORMAT,
            ChatError::NotAMember => group_status::NOT_A_MEMBER,
            _ => group_status::MARSHAL_ERROR,
        };
        let body = GroupTextMsgResp {
            status,
            msg_id: None,
            error: Some(err.wire_message()),
        };
        Bytes::from(serde_json::to_vec(&body).expect("response encode"))
    }

    async fn handle(
        &self,
        ctx: &AppContext,
        session: &Arc<Session>,
        payload: Bytes,
    ) -> Result<(), ChatError> {
        let identity = session.identity().ok_or(ChatError::Unauthenticated)?;
        let req: GroupTextMsgReq = serde_json::from_slice(&payload)?;
        let resp = routing::group::route(&ctx.services, &identity, req).await;
        session
            .send_json(msg_id::GROUP_TEXT_MSG_RESP, &resp)
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}
