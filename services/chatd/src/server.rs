//! TCP acceptor and per-connection lifecycle.
//!
//! Each accepted connection gets one reader loop (this module) and one
//! writer task (inside [`Session`]). The reader decodes frames, stamps
//! `last_seen`, and hands work to the dispatcher; it never runs handler
//! code itself. Connection teardown is the single place that drives the
//! coordinator's offline transition.
use crate::dispatch::Dispatcher;
use crate::handlers::handler_table;
use crate::heartbeat;
use crate::session::Session;
use crate::AppContext;
use anyhow::{Context, Result};
use parley_proto::{ErrorResp, code, msg_id};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct ServerHandle {
    addr: SocketAddr,
    ctx: Arc<AppContext>,
    dispatcher: Arc<Dispatcher>,
    accept_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn context(&self) -> Arc<AppContext> {
        Arc::clone(&self.ctx)
    }

    /// Graceful shutdown: stop accepting, announce, drop sessions, stop
    /// workers.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        if let Some(task) = self.heartbeat_task {
            task.abort();
        }
        self.ctx.coordinator.stop().await;
        for session in self.ctx.services.registry.all() {
            session.close();
        }
        self.dispatcher.shutdown();
        tracing::info!("server stopped");
    }
}

/// Bind the listener, start the coordinator, dispatcher, and supervisor,
/// and begin accepting connections.
pub async fn start(ctx: Arc<AppContext>) -> Result<ServerHandle> {
    let config = Arc::clone(&ctx.services.config);
    let listener = TcpListener::bind((config.host.as_str(), config.tcp_port))
        .await
        .with_context(|| format!("bind {}:{}", config.host, config.tcp_port))?;
    let addr = listener.local_addr().context("listener local addr")?;

    ctx.coordinator.start().await.context("coordinator start")?;

    let dispatcher = Arc::new(Dispatcher::start(
        Arc::clone(&ctx),
        handler_table(),
        config.worker_pool_size,
        config.max_msg_chan_len,
    ));

    let heartbeat_task = config
        .heartbeat
        .enabled
        .then(|| heartbeat::spawn(Arc::clone(&ctx.services.registry), config.heartbeat.clone()));

    let accept_task = {
        let ctx = Arc::clone(&ctx);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(accept_loop(listener, ctx, dispatcher))
    };

    tracing::info!(%addr, node_id = %ctx.services.node_id, "chat node listening");
    Ok(ServerHandle {
        addr,
        ctx,
        dispatcher,
        accept_task,
        heartbeat_task,
    })
}

async fn accept_loop(listener: TcpListener, ctx: Arc<AppContext>, dispatcher: Arc<Dispatcher>) {
    let conn_ids = AtomicU64::new(0);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        if ctx.services.registry.size() >= ctx.services.config.max_conn {
            tracing::warn!(%peer, "connection limit reached, refusing");
            drop(stream);
            continue;
        }
        let conn_id = conn_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = Arc::clone(&ctx);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(ctx, dispatcher, stream, conn_id, peer).await {
                tracing::warn!(conn_id, error = %err, "connection handler failed");
            }
        });
    }
}

async fn handle_connection(
    ctx: Arc<AppContext>,
    dispatcher: Arc<Dispatcher>,
    stream: TcpStream,
    conn_id: u64,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (mut read_half, write_half) = stream.into_split();
    let (session, writer_task) = Session::start(
        conn_id,
        peer,
        write_half,
        ctx.services.config.max_msg_chan_len,
    );
    ctx.services.registry.add(Arc::clone(&session));
    tracing::info!(conn_id, %peer, "connection opened");

    let max_packet_size = ctx.services.config.max_packet_size;
    loop {
        tokio::select! {
            _ = session.wait_closed() => break,
            result = parley_wire::read_frame(&mut read_half, max_packet_size) => {
                match result {
                    Ok(Some(frame)) => {
                        session.touch();
                        dispatcher.submit(Arc::clone(&session), frame).await;
                    }
                    Ok(None) => break,
                    Err(parley_wire::Error::OversizedFrame { got, max }) => {
                        tracing::warn!(conn_id, got, max, "oversized frame, closing");
                        let body = ErrorResp {
                            code: code::INVALID_FORMAT,
                            message: format!("frame of {got} bytes exceeds the {max} byte limit"),
                        };
                        let _ = session.send_json(msg_id::ERROR_RESP, &body);
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(conn_id, error = %err, "read failed");
                        break;
                    }
                }
            }
        }
    }

    // Teardown order matters: the registry entry goes first so no new
    // sender can pick this session up, then the coordinator transition.
    // A displaced connection was already removed by the rebinding login
    // and must not clear the new session's presence.
    let still_registered = ctx.services.registry.remove(conn_id).is_some();
    session.close();
    if still_registered && let Some(identity) = session.identity() {
        ctx.coordinator
            .handle_conn_stop(identity.user_id, &identity.user_uuid)
            .await;
    }
    let _ = writer_task.await;
    tracing::info!(conn_id, "connection closed");
    Ok(())
}
