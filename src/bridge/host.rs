//! Privileged side of the bridge.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel::{MessagePort, PortSender};
use super::protocol::BridgeMessage;

/// An operation that only the privileged context can perform.
#[async_trait]
pub trait HostOperation: Send + Sync {
    async fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> HostOperation for FnOperation<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Permanent listener answering requests by `type`.
///
/// Every request of a registered type gets exactly one reply. Requests of an
/// unknown type get none. Handlers are not deduplicated by id.
#[derive(Default)]
pub struct BridgeHost {
    operations: HashMap<String, Arc<dyn HostOperation>>,
}

impl BridgeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: impl Into<String>, operation: impl HostOperation + 'static) -> Self {
        self.operations.insert(kind.into(), Arc::new(operation));
        self
    }

    pub fn register_fn<F, Fut>(self, kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(kind, FnOperation(f))
    }

    pub fn spawn(self, port: MessagePort) -> JoinHandle<()> {
        tokio::spawn(self.serve(port))
    }

    /// Answer requests until the other end of `port` goes away.
    pub async fn serve(self, port: MessagePort) {
        let (sender, mut receiver) = port.split();

        while let Some(raw) = receiver.recv().await {
            let message: BridgeMessage = match serde_json::from_value(raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed bridge request");
                    continue;
                }
            };
            // Only the worker posts here; anything without a result is a
            // request, with or without arguments.
            if message.is_reply() {
                continue;
            }
            let Some(operation) = self.operations.get(&message.kind).cloned() else {
                warn!(kind = %message.kind, id = message.id(), "No handler for bridge request");
                continue;
            };

            tokio::spawn(answer(sender.clone(), operation, message));
        }
        debug!("Bridge host stopped");
    }
}

async fn answer(sender: PortSender, operation: Arc<dyn HostOperation>, message: BridgeMessage) {
    let id = message.id();
    let kind = message.kind;
    let args = message.args.args.unwrap_or_default();

    // Run in its own task so a panicking handler still produces a reply.
    let outcome = tokio::spawn(async move { operation.invoke(args).await }).await;
    let reply = match outcome {
        Ok(Ok(data)) => BridgeMessage::success(kind, id, data),
        Ok(Err(e)) => BridgeMessage::failure(kind, id, e.to_string()),
        Err(e) if e.is_panic() => BridgeMessage::failure(kind, id, "host operation panicked"),
        Err(_) => BridgeMessage::failure(kind, id, "host operation was aborted"),
    };

    match serde_json::to_value(&reply) {
        Ok(value) => {
            if !sender.post(value) {
                debug!(id, "Bridge caller went away before the reply");
            }
        }
        Err(e) => warn!(id, error = %e, "Failed to encode bridge reply"),
    }
}
