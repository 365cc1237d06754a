//! JSON-RPC 2.0 control surface over TCP.
//!
//! - `protocol`: request, response and notification types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: method dispatch onto the [`Orchestrator`]
//! - `client`: client used by the CLI subcommands

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::{JobCreated, MethodHandler};
pub use protocol::{
    JOB_NOT_FOUND, JOB_UPDATE, Notification, OPERATION_FAILED, Outcome, Request, Response,
    RpcError,
};

/// The daemon's control surface. Cheap to share behind an `Arc`.
pub struct RpcServer {
    transport: Transport,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub fn new(orchestrator: Orchestrator, bind_addr: SocketAddr) -> Self {
        Self {
            transport: Transport::new(bind_addr, MethodHandler::new(orchestrator)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the configured address and serve until [`RpcServer::shutdown`].
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transport.listen(self.shutdown.clone()).await
    }

    pub async fn start_with(&self, listener: TcpListener) -> anyhow::Result<()> {
        self.transport.serve(listener, self.shutdown.clone()).await
    }

    /// Stop accepting and drop open connections. Takes effect even before
    /// the server started.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
