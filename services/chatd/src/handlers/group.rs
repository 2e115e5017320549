//! Group management handlers: create, join, leave, member list, and the
//! caller's group list.
use crate::AppContext;
use crate::dispatch::Handler;
use crate::error::ChatError;
use crate::session::Session;
use crate::store::{DirectoryStore as _, Group, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::{
    CreateGroupReq, GroupInfo, GroupMemberInfo, GroupMembersReq, JoinGroupReq, LeaveGroupReq,
    StatusEnvelope, msg_id,
};
use std::sync::Arc;

fn status_error(err: &ChatError) -> Bytes {
    let body: StatusEnvelope<serde_json::Value> =
        StatusEnvelope::err(err.wire_code(), err.wire_message());
    Bytes::from(serde_json::to_vec(&body).expect("envelope encode"))
}

fn group_info(group: Group) -> GroupInfo {
    GroupInfo {
        id: group.id,
        name: group.name,
        owner_user_id: group.owner_user_id,
        description: group.description,
        avatar: group.avatar,
        member_count: group.member_count,
        created_at: group.created_at,
    }
}

pub struct CreateGroupHandler;

#[async_trait]
impl Handler for CreateGroupHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::CREATE_GROUP_RESP
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
        let req: CreateGroupReq = serde_json::from_slice(&payload)?;
        if req.name.is_empty() {
            return Err(ChatError::InvalidFormat("group name is required".to_string()));
        }
        let group = match ctx
            .services
            .directory
            .create_group(&req.name, identity.user_id, &req.description, &req.avatar)
            .await
        {
            Ok(group) => group,
            Err(StoreError::Conflict(msg)) => return Err(ChatError::InvalidFormat(msg)),
            Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
        };
        tracing::info!(group_id = group.id, owner = identity.user_id, "group created");

        // The owner is online here; start listening for the group's subject.
        ctx.coordinator
            .track_group_member(group.id, identity.user_id)
            .await;

        session
            .send_json(msg_id::CREATE_GROUP_RESP, &group_info(group))
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}

pub struct JoinGroupHandler;

#[async_trait]
impl Handler for JoinGroupHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::JOIN_GROUP_RESP
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
        let req: JoinGroupReq = serde_json::from_slice(&payload)?;
        let body = match ctx
            .services
            .directory
            .join_group(req.group_id, identity.user_id)
            .await
        {
            Ok(_) => {
                ctx.coordinator
                    .track_group_member(req.group_id, identity.user_id)
                    .await;
                tracing::info!(group_id = req.group_id, user_id = identity.user_id, "joined group");
                StatusEnvelope::<serde_json::Value>::ok("joined", serde_json::Value::Null)
            }
            // Joining twice is not an error worth surfacing.
            Err(StoreError::Conflict(_)) => {
                StatusEnvelope::<serde_json::Value>::ok("already a member", serde_json::Value::Null)
            }
            Err(StoreError::NotFound(_)) => return Err(ChatError::GroupNotFound),
            Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
        };
        session
            .send_json(msg_id::JOIN_GROUP_RESP, &body)
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}

pub struct LeaveGroupHandler;

#[async_trait]
impl Handler for LeaveGroupHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::LEAVE_GROUP_RESP
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
        let req: LeaveGroupReq = serde_json::from_slice(&payload)?;
        // Resolve the group first so "no such group" and "not a member"
        // stay distinguishable.
        if let Err(err) = ctx.services.directory.group_by_id(req.group_id).await {
            return Err(match err {
                StoreError::NotFound(_) => ChatError::GroupNotFound,
                other => ChatError::BackendUnavailable(other.to_string()),
            });
        }
        match ctx
            .services
            .directory
            .leave_group(req.group_id, identity.user_id)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Err(ChatError::OwnerCannotLeave),
            Err(StoreError::NotFound(_)) => return Err(ChatError::NotAMember),
            Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
        }
        ctx.coordinator
            .untrack_group_member(req.group_id, identity.user_id)
            .await;
        tracing::info!(group_id = req.group_id, user_id = identity.user_id, "left group");

        let body = StatusEnvelope::<serde_json::Value>::ok("left", serde_json::Value::Null);
        session
            .send_json(msg_id::LEAVE_GROUP_RESP, &body)
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}

pub struct GroupMembersHandler;

#[async_trait]
impl Handler for GroupMembersHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::GROUP_MEMBERS_RESP
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
        let req: GroupMembersReq = serde_json::from_slice(&payload)?;
        let member = match ctx
            .services
            .directory
            .is_member(req.group_id, identity.user_id)
            .await
        {
            Ok(member) => member,
            Err(StoreError::NotFound(_)) => return Err(ChatError::GroupNotFound),
            Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
        };
        if !member {
            return Err(ChatError::NotAMember);
        }

        let members = ctx
            .services
            .directory
            .members(req.group_id)
            .await
            .map_err(|err| ChatError::BackendUnavailable(err.to_string()))?;
        let mut infos = Vec::with_capacity(members.len());
        for member in members {
            match ctx.services.directory.user_by_id(member.user_id).await {
                Ok(user) => infos.push(GroupMemberInfo {
                    user_id: user.id,
                    user_uuid: user.user_uuid,
                    username: user.username,
                    role: member.role.as_str().to_string(),
                    joined_at: member.joined_at,
                }),
                Err(err) => {
                    tracing::warn!(user_id = member.user_id, error = %err,
                        "member row without a user record");
                }
            }
        }

        let body = StatusEnvelope::ok("members", infos);
        session
            .send_json(msg_id::GROUP_MEMBERS_RESP, &body)
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}

pub struct UserGroupsHandler;

#[async_trait]
impl Handler for UserGroupsHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::USER_GROUPS_RESP
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
        let groups = ctx
            .services
            .directory
            .user_groups(identity.user_id)
            .await
            .map_err(|err| ChatError::BackendUnavailable(err.to_string()))?;
        let infos: Vec<GroupInfo> = groups.into_iter().map(group_info).collect();
        let body = StatusEnvelope::ok("groups", infos);
        session
            .send_json(msg_id::USER_GROUPS_RESP, &body)
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}
