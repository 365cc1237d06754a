//! TCP transport with newline-delimited JSON framing.
//!
//! Each connection is handled in its own task. A `jobs.subscribe` call answers
//! with the current job and then streams `jobs.update` notifications until the
//! job is terminal or dismissed, after which the connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{JOB_UPDATE, Notification, Request, Response};
use crate::core::FlashJob;

pub struct Transport {
    bind_addr: SocketAddr,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(bind_addr: SocketAddr, handler: MethodHandler) -> Self {
        Self {
            bind_addr,
            handler: Arc::new(handler),
        }
    }

    pub async fn listen(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind RPC server to {}", self.bind_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections until `shutdown` is cancelled; open connections are
    /// dropped with it.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "RPC server listening");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            debug!(%peer, "Client connected");
            let handler = self.handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = handle_connection(stream, peer, handler) => {
                        if let Err(e) = result {
                            debug!(%peer, error = %e, "Connection error");
                        }
                    }
                }
                debug!(%peer, "Client disconnected");
            });
        }

        info!("RPC server stopped");
        Ok(())
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, message: &impl Serialize) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Unreadable request");
                write_line(&mut writer, &Response::parse_error(e)).await?;
                continue;
            }
        };
        let id = request.id.clone().unwrap_or(Value::Null);

        if let Err(rejection) = request.check() {
            warn!(peer = %peer_addr, error = %rejection.message, "Rejected request");
            write_line(&mut writer, &Response::failure(id, rejection)).await?;
            continue;
        }

        if !request.expects_reply() {
            debug!(peer = %peer_addr, method = %request.method, "Notification received");
            handler.handle(request).await;
            continue;
        }

        if request.method == "jobs.subscribe" {
            match handler
                .subscribe(&id, request.params.unwrap_or(Value::Null))
                .await
            {
                Ok(updates) => {
                    stream_job(&mut writer, id, updates).await?;
                    break;
                }
                Err(response) => write_line(&mut writer, &response).await?,
            }
            continue;
        }

        let response = handler.handle(request).await;
        write_line(&mut writer, &response).await?;
    }

    Ok(())
}

/// Reply with the current job, then push every change until it is terminal.
async fn stream_job<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: Value,
    mut updates: watch::Receiver<FlashJob>,
) -> anyhow::Result<()> {
    let current = updates.borrow_and_update().clone();
    write_line(writer, &Response::success(id, &current)).await?;
    if current.is_terminal() {
        return Ok(());
    }

    while updates.changed().await.is_ok() {
        let job = updates.borrow_and_update().clone();
        write_line(writer, &Notification::new(JOB_UPDATE, &job)).await?;
        if job.is_terminal() {
            break;
        }
    }
    Ok(())
}
