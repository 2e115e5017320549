//! TCP client for the parley chat protocol.
//!
//! One reader task decodes frames off the socket. Request/response pairs
//! are correlated by the response msg-id: each id keeps a FIFO of pending
//! waiters, so concurrent requests of the same kind resolve in send order.
//! Server-initiated frames (chat messages, group pushes, unsolicited
//! errors) land on a push queue the caller drains with [`ChatClient::next_push`].
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use parley_proto::{
    CreateGroupReq, Envelope, GroupInfo, GroupMemberInfo, GroupMembersReq, GroupTextMsgReq,
    GroupTextMsgResp, HistoryMsgReq, HistoryRecord, JoinGroupReq, LeaveGroupReq, LoginData,
    LoginReq, RegisterData, RegisterReq, StatusEnvelope, TextMsg, code, msg_id,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Synchronous request/response timeout.
    pub request_timeout: Duration,
    /// Automatic ping cadence; `None` disables the heartbeat task.
    pub heartbeat_interval: Option<Duration>,
    pub max_packet_size: usize,
    pub push_queue_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: None,
            max_packet_size: 4096,
            push_queue_len: 64,
        }
    }
}

/// A server-initiated frame.
#[derive(Debug, Clone)]
pub struct Push {
    pub msg_id: u32,
    pub payload: Bytes,
}

#[derive(Default)]
struct PendingWaiters {
    next_token: u64,
    // Response msg-id -> FIFO of (token, waiter).
    waiters: HashMap<u32, VecDeque<(u64, oneshot::Sender<Bytes>)>>,
}

struct Inner {
    writer: Mutex<OwnedWriteHalf>,
    pending: StdMutex<PendingWaiters>,
    config: ClientConfig,
}

impl Inner {
    async fn send_frame(&self, id: u32, payload: Bytes) -> Result<()> {
        let frame = parley_wire::Frame::new(id, payload);
        let mut writer = self.writer.lock().await;
        parley_wire::write_frame(&mut *writer, &frame)
            .await
            .context("write frame")
    }
}

pub struct ChatClient {
    inner: Arc<Inner>,
    pushes: Mutex<mpsc::Receiver<Push>>,
    identity: StdMutex<Option<LoginData>>,
    reader_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl ChatClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with(addr, ClientConfig::default()).await
    }

    pub async fn connect_with(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {addr}"))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let (push_tx, push_rx) = mpsc::channel(config.push_queue_len.max(1));
        let inner = Arc::new(Inner {
            writer: Mutex::new(write_half),
            pending: StdMutex::new(PendingWaiters::default()),
            config,
        });

        let reader_task = tokio::spawn(run_reader(
            read_half,
            Arc::clone(&inner),
            push_tx,
        ));
        let heartbeat_task = inner.config.heartbeat_interval.map(|interval| {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if inner
                        .send_frame(msg_id::PING, Bytes::from_static(b"ping"))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            })
        });

        Ok(Self {
            inner,
            pushes: Mutex::new(push_rx),
            identity: StdMutex::new(None),
            reader_task,
            heartbeat_task,
        })
    }

    /// Identity returned by the last successful login.
    pub fn identity(&self) -> Option<LoginData> {
        self.identity.lock().expect("identity lock").clone()
    }

    /// Send a frame without waiting for any response.
    pub async fn send(&self, id: u32, payload: Bytes) -> Result<()> {
        self.inner.send_frame(id, payload).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(msg_id::PING, Bytes::from_static(b"ping")).await
    }

    /// One request/response round trip correlated by `resp_id`.
    pub async fn request<T: Serialize>(
        &self,
        req_id: u32,
        resp_id: u32,
        body: &T,
    ) -> Result<Bytes> {
        let payload = Bytes::from(serde_json::to_vec(body).context("encode request")?);
        let (token, rx) = {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            pending.next_token += 1;
            let token = pending.next_token;
            let (tx, rx) = oneshot::channel();
            pending.waiters.entry(resp_id).or_default().push_back((token, tx));
            (token, rx)
        };

        if let Err(err) = self.inner.send_frame(req_id, payload).await {
            self.abandon_waiter(resp_id, token);
            return Err(err);
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                self.abandon_waiter(resp_id, token);
                bail!("connection closed while waiting for msg id {resp_id}")
            }
            Err(_) => {
                // Clean the pending entry up so a late response cannot pair
                // with the next request of this kind.
                self.abandon_waiter(resp_id, token);
                bail!("timed out waiting for msg id {resp_id}")
            }
        }
    }

    fn abandon_waiter(&self, resp_id: u32, token: u64) {
        let mut pending = self.inner.pending.lock().expect("pending lock");
        if let Some(queue) = pending.waiters.get_mut(&resp_id) {
            queue.retain(|(entry, _)| *entry != token);
        }
    }

    pub async fn register(&self, username: &str, password: &str, email: &str) -> Result<RegisterData> {
        let req = RegisterReq {
            username: username.to_string(),
            password: password.to_string(),
            email: email.to_string(),
        };
        let payload = self
            .request(msg_id::REGISTER_REQ, msg_id::REGISTER_RESP, &req)
            .await?;
        let envelope: Envelope<RegisterData> =
            serde_json::from_slice(&payload).context("decode register response")?;
        if envelope.code != code::OK {
            bail!("register failed ({}): {}", envelope.code, envelope.msg);
        }
        envelope.data.ok_or_else(|| anyhow!("register response missing data"))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginData> {
        let req = LoginReq {
            username: username.to_string(),
            password: password.to_string(),
        };
        let payload = self
            .request(msg_id::LOGIN_REQ, msg_id::LOGIN_RESP, &req)
            .await?;
        let envelope: Envelope<LoginData> =
            serde_json::from_slice(&payload).context("decode login response")?;
        if envelope.code != code::OK {
            bail!("login failed ({}): {}", envelope.code, envelope.msg);
        }
        let data = envelope.data.ok_or_else(|| anyhow!("login response missing data"))?;
        *self.identity.lock().expect("identity lock") = Some(data.clone());
        Ok(data)
    }

    pub async fn logout(&self) -> Result<()> {
        let payload = self
            .request(msg_id::LOGOUT_REQ, msg_id::LOGOUT_RESP, &serde_json::json!({}))
            .await?;
        let envelope: Envelope<serde_json::Value> =
            serde_json::from_slice(&payload).context("decode logout response")?;
        if envelope.code != code::OK {
            bail!("logout failed ({}): {}", envelope.code, envelope.msg);
        }
        self.identity.lock().expect("identity lock").take();
        Ok(())
    }

    /// Fire-and-forget text message; delivery failures come back as pushed
    /// error frames.
    pub async fn send_text(&self, to_user_id: &str, content: &str) -> Result<()> {
        let msg = TextMsg {
            from_user_id: None,
            to_user_id: to_user_id.to_string(),
            content: content.to_string(),
            msg_type: None,
            sent_at: None,
        };
        let payload = Bytes::from(serde_json::to_vec(&msg).context("encode text")?);
        self.send(msg_id::TEXT_MSG, payload).await
    }

    pub async fn history(&self, target_user_uuid: &str, limit: i64) -> Result<Vec<HistoryRecord>> {
        let req = HistoryMsgReq {
            target_user_uuid: target_user_uuid.to_string(),
            limit,
        };
        let payload = self
            .request(msg_id::HISTORY_MSG_REQ, msg_id::HISTORY_MSG_RESP, &req)
            .await?;
        decode_status_data(&payload, "history")
    }

    pub async fn relations(&self) -> Result<Vec<u64>> {
        let payload = self
            .request(
                msg_id::CHAT_RELATION_REQ,
                msg_id::CHAT_RELATION_RESP,
                &serde_json::json!({}),
            )
            .await?;
        decode_status_data(&payload, "chat relations")
    }

    pub async fn create_group(&self, name: &str, description: &str, avatar: &str) -> Result<GroupInfo> {
        let req = CreateGroupReq {
            name: name.to_string(),
            description: description.to_string(),
            avatar: avatar.to_string(),
        };
        let payload = self
            .request(msg_id::CREATE_GROUP_REQ, msg_id::CREATE_GROUP_RESP, &req)
            .await?;
        // Success is the group object itself; failures use the status shape.
        if let Ok(group) = serde_json::from_slice::<GroupInfo>(&payload) {
            return Ok(group);
        }
        let envelope: StatusEnvelope<serde_json::Value> =
            serde_json::from_slice(&payload).context("decode create group response")?;
        bail!("create group failed ({}): {}", envelope.code, envelope.message)
    }

    pub async fn join_group(&self, group_id: u64) -> Result<()> {
        let payload = self
            .request(
                msg_id::JOIN_GROUP_REQ,
                msg_id::JOIN_GROUP_RESP,
                &JoinGroupReq { group_id },
            )
            .await?;
        expect_status_ok(&payload, "join group")
    }

    pub async fn leave_group(&self, group_id: u64) -> Result<()> {
        let payload = self
            .request(
                msg_id::LEAVE_GROUP_REQ,
                msg_id::LEAVE_GROUP_RESP,
                &LeaveGroupReq { group_id },
            )
            .await?;
        expect_status_ok(&payload, "leave group")
    }

    pub async fn group_members(&self, group_id: u64) -> Result<Vec<GroupMemberInfo>> {
        let payload = self
            .request(
                msg_id::GROUP_MEMBERS_REQ,
                msg_id::GROUP_MEMBERS_RESP,
                &GroupMembersReq { group_id },
            )
            .await?;
        decode_status_data(&payload, "group members")
    }

    pub async fn user_groups(&self) -> Result<Vec<GroupInfo>> {
        let payload = self
            .request(
                msg_id::USER_GROUPS_REQ,
                msg_id::USER_GROUPS_RESP,
                &serde_json::json!({}),
            )
            .await?;
        decode_status_data(&payload, "user groups")
    }

    /// Send a group message and return the status-coded ack.
    pub async fn send_group_text(&self, group_id: u64, content: &str) -> Result<GroupTextMsgResp> {
        let req = GroupTextMsgReq {
            group_id,
            content: content.to_string(),
        };
        let payload = self
            .request(msg_id::GROUP_TEXT_MSG_REQ, msg_id::GROUP_TEXT_MSG_RESP, &req)
            .await?;
        serde_json::from_slice(&payload).context("decode group text response")
    }

    /// Next server-initiated frame, or an error after `wait`.
    pub async fn next_push(&self, wait: Duration) -> Result<Push> {
        let mut pushes = self.pushes.lock().await;
        match tokio::time::timeout(wait, pushes.recv()).await {
            Ok(Some(push)) => Ok(push),
            Ok(None) => bail!("connection closed"),
            Err(_) => bail!("no push within {wait:?}"),
        }
    }

    pub async fn close(self) {
        if let Some(task) = self.heartbeat_task {
            task.abort();
        }
        self.reader_task.abort();
        use tokio::io::AsyncWriteExt;
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

fn decode_status_data<T: DeserializeOwned>(payload: &[u8], what: &str) -> Result<T> {
    let envelope: StatusEnvelope<T> =
        serde_json::from_slice(payload).with_context(|| format!("decode {what} response"))?;
    if envelope.code != code::OK {
        bail!("{what} failed ({}): {}", envelope.code, envelope.message);
    }
    envelope
        .data
        .ok_or_else(|| anyhow!("{what} response missing data"))
}

fn expect_status_ok(payload: &[u8], what: &str) -> Result<()> {
    let envelope: StatusEnvelope<serde_json::Value> =
        serde_json::from_slice(payload).with_context(|| format!("decode {what} response"))?;
    if envelope.code != code::OK {
        bail!("{what} failed ({}): {}", envelope.code, envelope.message);
    }
    Ok(())
}

async fn run_reader(mut read_half: OwnedReadHalf, inner: Arc<Inner>, pushes: mpsc::Sender<Push>) {
    loop {
        let frame = match parley_wire::read_frame(&mut read_half, inner.config.max_packet_size).await
        {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "client read failed");
                break;
            }
        };
        if frame.msg_id == msg_id::PONG {
            continue;
        }
        // A pending waiter for this id wins; everything else is a push.
        let waiter = {
            let mut pending = inner.pending.lock().expect("pending lock");
            pending
                .waiters
                .get_mut(&frame.msg_id)
                .and_then(|queue| queue.pop_front())
        };
        match waiter {
            Some((_, tx)) => {
                let _ = tx.send(frame.payload);
            }
            None => {
                if pushes
                    .send(Push {
                        msg_id: frame.msg_id,
                        payload: frame.payload,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    // Wake every in-flight request with a closed-channel error.
    let mut pending = inner.pending.lock().expect("pending lock");
    pending.waiters.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_resolve_in_fifo_order_per_id() {
        let mut pending = PendingWaiters::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.waiters.entry(104).or_default().push_back((1, tx1));
        pending.waiters.entry(104).or_default().push_back((2, tx2));

        let first = pending
            .waiters
            .get_mut(&104)
            .and_then(|queue| queue.pop_front())
            .expect("first waiter");
        first.1.send(Bytes::from_static(b"a")).expect("send");
        assert_eq!(rx1.try_recv().expect("rx1"), Bytes::from_static(b"a"));
        assert!(rx2.try_recv().is_err());

        let second = pending
            .waiters
            .get_mut(&104)
            .and_then(|queue| queue.pop_front())
            .expect("second waiter");
        second.1.send(Bytes::from_static(b"b")).expect("send");
        assert_eq!(rx2.try_recv().expect("rx2"), Bytes::from_static(b"b"));
    }

    #[test]
    fn abandoned_tokens_are_removed_mid_queue() {
        let mut pending = PendingWaiters::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        let queue = pending.waiters.entry(205).or_default();
        queue.push_back((1, tx1));
        queue.push_back((2, tx2));
        queue.push_back((3, tx3));

        queue.retain(|(token, _)| *token != 2);
        let tokens: Vec<u64> = queue.iter().map(|(token, _)| *token).collect();
        assert_eq!(tokens, vec![1, 3]);
    }
}
