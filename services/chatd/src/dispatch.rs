//! Frame dispatch: the msg-id handler table, the authentication gate, and
//! the worker pool that decouples handler work from connection readers.
//!
//! Workers are selected by `conn_id % pool_size`, so frames from one
//! connection always run on one worker in arrival order while different
//! connections proceed in parallel. Heartbeat frames are answered inline
//! and never reach a handler.
use crate::AppContext;
use crate::error::ChatError;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::{ErrorResp, msg_id};
use parley_wire::Frame;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[async_trait]
pub trait Handler: Send + Sync {
    /// Gate: unauthenticated sessions are refused before `handle` runs.
    fn requires_auth(&self) -> bool {
        true
    }

    /// Where error payloads for this handler are written. Push-style
    /// handlers keep the generic error id.
    fn response_msg_id(&self) -> u32 {
        msg_id::ERROR_RESP
    }

    /// Render a domain error into this handler's response shape. The
    /// default is the generic `{code, message}` error body.
    fn render_error(&self, err: &ChatError) -> Bytes {
        let body = ErrorResp {
            code: err.wire_code(),
            message: err.wire_message(),
        };
        Bytes::from(serde_json::to_vec(&body).expect("error body encode"))
    }

    async fn pre_handle(
        &self,
        _ctx: &AppContext,
        _session: &Arc<Session>,
        _payload: &Bytes,
    ) -> Result<(), ChatError> {
        Ok(())
    }

    async fn handle(
        &self,
        ctx: &AppContext,
        session: &Arc<Session>,
        payload: Bytes,
    ) -> Result<(), ChatError>;

    async fn post_handle(&self, _ctx: &AppContext, _session: &Arc<Session>) {}
}

struct Job {
    session: Arc<Session>,
    frame: Frame,
}

pub struct Dispatcher {
    workers: Vec<mpsc::Sender<Job>>,
    worker_tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start(
        ctx: Arc<AppContext>,
        handlers: HashMap<u32, Arc<dyn Handler>>,
        pool_size: usize,
        queue_len: usize,
    ) -> Self {
        let handlers = Arc::new(handlers);
        let pool_size = pool_size.max(1);
        let mut workers = Vec::with_capacity(pool_size);
        let mut worker_tasks = Vec::with_capacity(pool_size);
        for worker_id in 0..pool_size {
            let (tx, rx) = mpsc::channel(queue_len.max(1));
            workers.push(tx);
            worker_tasks.push(tokio::spawn(run_worker(
                worker_id,
                rx,
                Arc::clone(&ctx),
                Arc::clone(&handlers),
            )));
        }
        Self {
            workers,
            worker_tasks,
        }
    }

    /// Hand a decoded frame to the worker pool. Heartbeats short-circuit
    /// here so ping/pong traffic never competes with handler queues.
    pub async fn submit(&self, session: Arc<Session>, frame: Frame) {
        match frame.msg_id {
            msg_id::PING => {
                let _ = session.send(msg_id::PONG, Bytes::from_static(b"pong"));
                return;
            }
            msg_id::PONG => return,
            _ => {}
        }
        let worker = (session.conn_id() % self.workers.len() as u64) as usize;
        // Awaiting the send applies backpressure to this connection's
        // reader without blocking other connections' workers.
        if self.workers[worker]
            .send(Job { session, frame })
            .await
            .is_err()
        {
            tracing::error!(worker, "dispatch worker queue closed");
        }
    }

    pub fn shutdown(&self) {
        for task in &self.worker_tasks {
            task.abort();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    mut rx: mpsc::Receiver<Job>,
    ctx: Arc<AppContext>,
    handlers: Arc<HashMap<u32, Arc<dyn Handler>>>,
) {
    while let Some(Job { session, frame }) = rx.recv().await {
        dispatch_one(&ctx, &handlers, session, frame).await;
    }
    tracing::debug!(worker_id, "dispatch worker stopped");
}

async fn dispatch_one(
    ctx: &AppContext,
    handlers: &HashMap<u32, Arc<dyn Handler>>,
    session: Arc<Session>,
    frame: Frame,
) {
    let Some(handler) = handlers.get(&frame.msg_id) else {
        tracing::debug!(conn_id = session.conn_id(), msg_id = frame.msg_id, "unknown msg id");
        let body = ErrorResp {
            code: parley_proto::code::INVALID_FORMAT,
            message: format!("unknown msg id {}", frame.msg_id),
        };
        let _ = session.send_json(msg_id::ERROR_RESP, &body);
        return;
    };

    // The auth gate runs before any handler code.
    if handler.requires_auth() && !session.is_authenticated() {
        let err = ChatError::Unauthenticated;
        let _ = session.send(handler.response_msg_id(), handler.render_error(&err));
        return;
    }

    // Optional signed-request check for protected handlers.
    if handler.requires_auth()
        && let Some(signature) = &ctx.services.signature
        && let Err(err) = verify_signature(signature, &frame.payload).await
    {
        tracing::warn!(conn_id = session.conn_id(), error = %err, "request signature rejected");
        let _ = session.send(handler.response_msg_id(), handler.render_error(&err));
        return;
    }

    if let Err(err) = handler.pre_handle(ctx, &session, &frame.payload).await {
        let _ = session.send(handler.response_msg_id(), handler.render_error(&err));
        return;
    }
    if let Err(err) = handler.handle(ctx, &session, frame.payload).await {
        // Log the specific cause; the wire shape may be collapsed.
        tracing::info!(
            conn_id = session.conn_id(),
            msg_id = frame.msg_id,
            error = %err,
            "handler failed"
        );
        let _ = session.send(handler.response_msg_id(), handler.render_error(&err));
        return;
    }
    handler.post_handle(ctx, &session).await;
}

async fn verify_signature(
    verifier: &parley_auth::signature::SignatureVerifier,
    payload: &Bytes,
) -> Result<(), ChatError> {
    #[derive(serde::Deserialize)]
    struct Signed {
        timestamp: i64,
        nonce: String,
        signature: String,
    }
    let signed: Signed = serde_json::from_slice(payload)
        .map_err(|_| ChatError::InvalidFormat("missing signature fields".to_string()))?;
    verifier
        .verify(signed.timestamp, &signed.nonce, &signed.signature)
        .await
        .map_err(|_| ChatError::PermissionDenied)
}
