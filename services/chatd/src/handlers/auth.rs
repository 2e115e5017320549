//! Account lifecycle handlers: register, login, logout.
//!
//! Login failure specifics (unknown user vs. wrong password) are logged but
//! collapse to one generic wire response. A successful login binds the
//! session in the registry (displacing any prior one), replies, replays the
//! offline queue, and only then brings the user online on the bus so the
//! drain cannot race live deliveries.
use crate::AppContext;
use crate::dispatch::Handler;
use crate::error::ChatError;
use crate::session::{Identity, Session};
use crate::store::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use parley_auth::password;
use parley_proto::{
    Envelope, ErrorResp, LoginData, LoginReq, RegisterData, RegisterReq, code, msg_id,
};
use std::sync::Arc;

fn envelope_error(err: &ChatError) -> Bytes {
    let body: Envelope<serde_json::Value> = Envelope::err(err.wire_code(), err.wire_message());
    Bytes::from(serde_json::to_vec(&body).expect("envelope encode"))
}

pub struct RegisterHandler;

#[async_trait]
impl Handler for RegisterHandler {
    fn requires_auth(&self) -> bool {
        false
    }

    fn response_msg_id(&self) -> u32 {
        msg_id::REGISTER_RESP
    }

    fn render_error(&self, err: &ChatError) -> Bytes {
        envelope_error(err)
    }

    async fn handle(
        &self,
        ctx: &AppContext,
        session: &Arc<Session>,
        payload: Bytes,
    ) -> Result<(), ChatError> {
        let req: RegisterReq = serde_json::from_slice(&payload)?;
        if req.username.is_empty() || req.password.is_empty() {
            return Err(ChatError::InvalidFormat(
                "username and password are required".to_string(),
            ));
        }

        let hash = password::hash(&req.password)
            .map_err(|err| ChatError::Internal(err.to_string()))?;
        let user = match ctx
            .services
            .directory
            .create_user(&req.username, &hash, &req.email)
            .await
        {
            Ok(user) => user,
            Err(StoreError::Conflict(_)) => return Err(ChatError::UsernameExists),
            Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
        };
        tracing::info!(user_id = user.id, username = %user.username, "user registered");

        let body = Envelope::ok(
            "registered",
            RegisterData {
                id: user.id,
                user_uuid: user.user_uuid,
                username: user.username,
                email: user.email,
                avatar: user.avatar,
                token: None,
            },
        );
        session
            .send_json(msg_id::REGISTER_RESP, &body)
            .map_err(|err| ChatError::Internal(err.to_string()))
    }
}

pub struct LoginHandler;

#[async_trait]
impl Handler for LoginHandler {
    fn requires_auth(&self) -> bool {
        false
    }

    fn response_msg_id(&self) -> u32 {
        msg_id::LOGIN_RESP
    }

    fn render_error(&self, err: &ChatError) -> Bytes {
        envelope_error(err)
    }

    async fn handle(
        &self,
        ctx: &AppContext,
        session: &Arc<Session>,
        payload: Bytes,
    ) -> Result<(), ChatError> {
        let req: LoginReq = serde_json::from_slice(&payload)?;
        if req.username.is_empty() || req.password.is_empty() {
            return Err(ChatError::InvalidFormat(
                "username and password are required".to_string(),
            ));
        }

        let user = match ctx.services.directory.user_by_username(&req.username).await {
            Ok(user) => user,
            Err(StoreError::NotFound(_)) => {
                tracing::info!(username = %req.username, "login failed: user not found");
                return Err(ChatError::UserNotFound);
            }
            Err(err) => return Err(ChatError::BackendUnavailable(err.to_string())),
        };
        let matches = password::verify(&req.password, &user.password_hash)
            .map_err(|err| ChatError::Internal(err.to_string()))?;
        if !matches {
            tracing::info!(username = %req.username, "login failed: password incorrect");
            return Err(ChatError::PasswordIncorrect);
        }

        let previous_login = ctx
            .services
            .directory
            .mark_login(user.id)
            .await
            .map_err(|err| ChatError::BackendUnavailable(err.to_string()))?;
        let token = ctx
            .services
            .tokens
            .mint(user.id, &user.user_uuid, &user.username)
            .map_err(|err| ChatError::Internal(err.to_string()))?;
        ctx.services.session_mirror.store(user.id, &token).await?;

        session.authenticate(Identity {
            user_id: user.id,
            user_uuid: user.user_uuid.clone(),
            username: user.username.clone(),
        });

        // Newest login wins. Tell the old connection why before the bind
        // closes it.
        if let Some(prior) = ctx.services.registry.by_user_id(user.id)
            && prior.conn_id() != session.conn_id()
        {
            let notice = ErrorResp {
                code: code::UNAUTHENTICATED,
                message: "session displaced by a newer login".to_string(),
            };
            let _ = prior.send_json(msg_id::ERROR_RESP, &notice);
        }
        ctx.services.registry.bind(user.id, session.conn_id());
        tracing::info!(user_id = user.id, username = %user.username, "login ok");

        let body = Envelope::ok(
            "login ok",
            LoginData {
                id: user.id,
                user_uuid: user.user_uuid.clone(),
                username: user.username.clone(),
                email: user.email.clone(),
                avatar: user.avatar.clone(),
                last_login: previous_login,
                token,
            },
        );
        session
            .send_json(msg_id::LOGIN_RESP, &body)
            .map_err(|err| ChatError::Internal(err.to_string()))?;

        // Drain the offline queue before subscribing to live subjects so a
        // drained message cannot interleave with a later bus delivery.
        ctx.coordinator.replay_offline(session, user.id).await;
        if let Err(err) = ctx
            .coordinator
            .handle_user_online(user.id, &user.user_uuid)
            .await
        {
            tracing::warn!(user_id = user.id, error = %err, "online transition incomplete");
        }
        Ok(())
    }
}

pub struct LogoutHandler;

#[async_trait]
impl Handler for LogoutHandler {
    fn response_msg_id(&self) -> u32 {
        msg_id::LOGOUT_RESP
    }

    fn render_error(&self, err: &ChatError) -> Bytes {
        envelope_error(err)
    }

    async fn handle(
        &self,
        ctx: &AppContext,
        session: &Arc<Session>,
        _payload: Bytes,
    ) -> Result<(), ChatError> {
        let identity = session.identity().ok_or(ChatError::Unauthenticated)?;
        ctx.services.session_mirror.clear(identity.user_id).await?;
        ctx.services
            .registry
            .unbind(identity.user_id, session.conn_id());
        ctx.coordinator
            .handle_user_offline(identity.user_id, &identity.user_uuid)
            .await;

        let body: Envelope<serde_json::Value> = Envelope {
            code: code::OK,
            msg: "logged out".to_string(),
            data: None,
        };
        let _ = session.send_json(msg_id::LOGOUT_RESP, &body);
        // Close after the response frame is queued; the writer flushes it.
        session.close();
        tracing::info!(user_id = identity.user_id, "logout");
        Ok(())
    }
}
