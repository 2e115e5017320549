//! Protocol handlers, one per request kind, registered in [`handler_table`].
use crate::dispatch::Handler;
use parley_proto::msg_id;
use std::collections::HashMap;
use std::sync::Arc;

pub mod auth;
pub mod group;
pub mod group_text;
pub mod history;
pub mod text;

/// The authoritative msg-id -> handler table. Heartbeats are answered by
/// the dispatcher itself and do not appear here.
pub fn handler_table() -> HashMap<u32, Arc<dyn Handler>> {
    let mut table: HashMap<u32, Arc<dyn Handler>> = HashMap::new();
    table.insert(msg_id::REGISTER_REQ, Arc::new(auth::RegisterHandler));
    table.insert(msg_id::LOGIN_REQ, Arc::new(auth::LoginHandler));
    table.insert(msg_id::LOGOUT_REQ, Arc::new(auth::LogoutHandler));

    // Text, image, and file payloads share the routing engine; each keeps
    // its own id on delivery.
    table.insert(
        msg_id::TEXT_MSG,
        Arc::new(text::P2pMsgHandler::new(msg_id::TEXT_MSG)),
    );
    table.insert(
        msg_id::IMAGE_MSG,
        Arc::new(text::P2pMsgHandler::new(msg_id::IMAGE_MSG)),
    );
    table.insert(
        msg_id::FILE_MSG,
        Arc::new(text::P2pMsgHandler::new(msg_id::FILE_MSG)),
    );

    table.insert(msg_id::HISTORY_MSG_REQ, Arc::new(history::HistoryMsgHandler));
    table.insert(
        msg_id::CHAT_RELATION_REQ,
        Arc::new(history::ChatRelationHandler),
    );

    table.insert(msg_id::CREATE_GROUP_REQ, Arc::new(group::CreateGroupHandler));
    table.insert(msg_id::JOIN_GROUP_REQ, Arc::new(group::JoinGroupHandler));
    table.insert(msg_id::LEAVE_GROUP_REQ, Arc::new(group::LeaveGroupHandler));
    table.insert(msg_id::GROUP_MEMBERS_REQ, Arc::new(group::GroupMembersHandler));
    table.insert(msg_id::USER_GROUPS_REQ, Arc::new(group::UserGroupsHandler));

    table.insert(
        msg_id::GROUP_TEXT_MSG_REQ,
        Arc::new(group_text::GroupTextMsgHandler),
    );
    table
}
