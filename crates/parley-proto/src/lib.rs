//! Message identifiers and payload types shared by the server and client.
//!
//! Every frame payload is UTF-8 JSON. The id table below is the single
//! authoritative assignment; ranges are grouped by feature so new pairs can
//! slot in without renumbering.

use serde::{Deserialize, Serialize};

pub mod msg_id {
    //! Wire message identifiers.

    // Heartbeat: 1-2.
    pub const PING: u32 = 1;
    pub const PONG: u32 = 2;

    // Generic error response, server to client.
    pub const ERROR_RESP: u32 = 99;

    // Account lifecycle: 101-106.
    pub const REGISTER_REQ: u32 = 101;
    pub const REGISTER_RESP: u32 = 102;
    pub const LOGIN_REQ: u32 = 103;
    pub const LOGIN_RESP: u32 = 104;
    pub const LOGOUT_REQ: u32 = 105;
    pub const LOGOUT_RESP: u32 = 106;

    // Point-to-point chat: 201-207.
    pub const TEXT_MSG: u32 = 201;
    pub const IMAGE_MSG: u32 = 202;
    pub const FILE_MSG: u32 = 203;
    pub const HISTORY_MSG_REQ: u32 = 204;
    pub const HISTORY_MSG_RESP: u32 = 205;
    pub const CHAT_RELATION_REQ: u32 = 206;
    pub const CHAT_RELATION_RESP: u32 = 207;

    // Group management: 208-218.
    pub const CREATE_GROUP_REQ: u32 = 208;
    pub const CREATE_GROUP_RESP: u32 = 209;
    pub const JOIN_GROUP_REQ: u32 = 210;
    pub const JOIN_GROUP_RESP: u32 = 211;
    pub const LEAVE_GROUP_REQ: u32 = 212;
    pub const LEAVE_GROUP_RESP: u32 = 213;
    pub const GROUP_MEMBERS_REQ: u32 = 215;
    pub const GROUP_MEMBERS_RESP: u32 = 216;
    pub const USER_GROUPS_REQ: u32 = 217;
    pub const USER_GROUPS_RESP: u32 = 218;

    // Group chat: 310-312.
    pub const GROUP_TEXT_MSG_REQ: u32 = 310;
    pub const GROUP_TEXT_MSG_RESP: u32 = 311;
    pub const GROUP_TEXT_MSG_PUSH: u32 = 312;
}

pub mod code {
    //! Response codes. Zero is success everywhere; nonzero values name the
    //! failure kind carried in the accompanying message string.

    pub const OK: u32 = 0;
    pub const INVALID_FORMAT: u32 = 1;
    pub const UNAUTHENTICATED: u32 = 2;
    pub const INVALID_CREDENTIALS: u32 = 3;
    pub const USERNAME_EXISTS: u32 = 4;
    pub const NOT_A_MEMBER: u32 = 5;
    pub const GROUP_NOT_FOUND: u32 = 6;
    pub const PERMISSION_DENIED: u32 = 7;
    pub const OWNER_CANNOT_LEAVE: u32 = 8;
    pub const RECIPIENT_UNKNOWN: u32 = 9;
    pub const TIMEOUT: u32 = 10;
    pub const BACKEND_UNAVAILABLE: u32 = 11;
    pub const INTERNAL: u32 = 12;
}

/// Status values carried in [`GroupTextMsgResp`].
pub mod group_status {
    pub const OK: u32 = 0;
    pub const INVALID_FORMAT: u32 = 1;
    pub const MEMBERSHIP_CHECK_FAILED: u32 = 2;
    pub const NOT_A_MEMBER: u32 = 3;
    pub const MEMBER_FETCH_FAILED: u32 = 4;
    pub const MARSHAL_ERROR: u32 = 5;
}

/// Generic error payload on [`msg_id::ERROR_RESP`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResp {
    pub code: u32,
    pub message: String,
}

/// `{code, msg, data}` envelope used by the account endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope<T> {
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(msg: impl Into<String>, data: T) -> Self {
        Self {
            code: code::OK,
            msg: msg.into(),
            data: Some(data),
        }
    }

    pub fn err(code: u32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// `{code, message, data}` envelope used by the query and group endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEnvelope<T> {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> StatusEnvelope<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            code: code::OK,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn err(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterReq {
    pub username: String,
    pub password: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterData {
    pub id: u64,
    pub user_uuid: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginReq {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginData {
    pub id: u64,
    pub user_uuid: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub avatar: String,
    /// Unix seconds of the previous successful login, zero for the first.
    #[serde(default)]
    pub last_login: i64,
    pub token: String,
}

/// Point-to-point chat payload, shared by text, image, and file messages.
///
/// `from_user_id` is stamped by the server with the sender's UUID before the
/// payload is routed; clients may leave it empty. `to_user_id` accepts a
/// UUID, a username, or a decimal user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    pub to_user_id: String,
    pub content: String,
    #[serde(
        default,
        rename = "type",
        skip_serializing_if = "Option::is_none"
    )]
    pub msg_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryMsgReq {
    pub target_user_uuid: String,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    pub from_user_id: String,
    pub content: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateGroupReq {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: u64,
    pub name: String,
    pub owner_user_id: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar: String,
    pub member_count: u32,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinGroupReq {
    pub group_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaveGroupReq {
    pub group_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMembersReq {
    pub group_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMemberInfo {
    pub user_id: u64,
    pub user_uuid: String,
    pub username: String,
    pub role: String,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupTextMsgReq {
    pub group_id: u64,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupTextMsgResp {
    pub status: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupTextMsgPush {
    pub group_id: u64,
    pub from_user_id: u64,
    pub from_user_uuid: String,
    pub from_username: String,
    pub content: String,
    pub timestamp: i64,
}
