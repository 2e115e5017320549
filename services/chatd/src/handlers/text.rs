//! Point-to-point message handler; thin shell over the routing engine.
//! Success is silent (the peer's frame is the signal); failures come back
//! as generic error responses.
use crate::AppContext;
use crate::dispatch::Handler;
use crate::error::ChatError;
use crate::routing;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::TextMsg;
use std::sync::Arc;

pub struct P2pMsgHandler {
    deliver_msg_id: u32,
}

impl P2pMsgHandler {
    pub fn new(deliver_msg_id: u32) -> Self {
        Self { deliver_msg_id }
    }
}

#[async_trait]
impl Handler for P2pMsgHandler {
    async fn handle(
        &self,
        ctx: &AppContext,
        session: &Arc<Session>,
        payload: Bytes,
    ) -> Result<(), ChatError> {
        let identity = session.identity().ok_or(ChatError::Unauthenticated)?;
        let msg: TextMsg = serde_json::from_slice(&payload)?;
        routing::p2p::route(&ctx.services, &identity, self.deliver_msg_id, msg).await
    }
}
