//! TCP listener speaking the command wire protocol.
//!
//! One task per connection; requests are parsed, wrapped into commands, and
//! pushed onto the queue, then the task waits for the worker's response.
//! Health probes and crash notifications are answered inline so they still
//! work when the queue is saturated.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::blacklist::CommandBlacklist;
use crate::cluster::RoleState;
use crate::command::Command;
use crate::crash;
use crate::message::{Message, STATUS_BAD_REQUEST, STATUS_OK};
use crate::queue::CommandQueue;

pub struct ServerContext {
    node_id: u64,
    queue: Arc<CommandQueue>,
    blacklist: Arc<CommandBlacklist>,
    role: Arc<RoleState>,
    default_timeout_ms: u64,
    next_command_id: AtomicU64,
}

impl ServerContext {
    pub fn new(
        node_id: u64,
        queue: Arc<CommandQueue>,
        blacklist: Arc<CommandBlacklist>,
        role: Arc<RoleState>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            node_id,
            queue,
            blacklist,
            role,
            default_timeout_ms,
            next_command_id: AtomicU64::new(0),
        }
    }

    fn next_command_id(&self) -> String {
        let seq = self.next_command_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}#{}", self.node_id, seq)
    }
}

pub async fn run(addr: SocketAddr, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening for commands");
    loop {
        let (socket, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, ctx).await {
                tracing::debug!(error = ?err, %peer, "connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let request = match Message::read_from_async(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) => {
                let _ = write_half
                    .write_all(&Message::response(STATUS_BAD_REQUEST).to_bytes())
                    .await;
                return Err(err);
            }
        };

        match request.method_line.as_str() {
            "Ping" => {
                let mut resp = Message::response(STATUS_OK);
                resp.set("state", ctx.role.role().as_str());
                write_half.write_all(&resp.to_bytes()).await?;
            }
            crash::CRASH_COMMAND => {
                let method = request.get("methodLine").unwrap_or_default();
                let user_id = request.get("userID").unwrap_or_default();
                if method.is_empty() {
                    tracing::warn!("crash notification without a method line");
                } else {
                    tracing::warn!(method, user_id, "peer died on command; blacklisting");
                    ctx.blacklist.record(method, user_id);
                }
                write_half
                    .write_all(&Message::response(STATUS_OK).to_bytes())
                    .await?;
            }
            _ => {
                let (tx, rx) = oneshot::channel();
                let cmd = Command::from_request(
                    ctx.next_command_id(),
                    request,
                    ctx.default_timeout_ms,
                )
                .with_responder(tx);
                ctx.queue.push(cmd);
                match rx.await {
                    Ok(response) => write_half.write_all(&response.to_bytes()).await?,
                    // The command was dropped without a response (shutdown
                    // clears the queue); the client observes an empty
                    // response on close.
                    Err(_) => return Ok(()),
                }
            }
        }
    }
}
