//! Caller side of the bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel::{MessagePort, PortReceiver, PortSender};
use super::protocol::BridgeMessage;
use crate::error::BridgeError;

type PendingTable = Arc<Mutex<HashMap<u64, PendingCall>>>;

/// An outstanding call waiting for its reply.
struct PendingCall {
    kind: String,
    reply: oneshot::Sender<Result<Value, String>>,
}

/// Removes the pending entry when the caller stops waiting, whatever the reason.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Issues calls across the bridge and correlates replies by id.
///
/// There is no built-in timeout. A caller that needs one races [`BridgeClient::call`]
/// against its own timer; a reply that arrives after the call was abandoned
/// finds no pending entry and is dropped.
pub struct BridgeClient {
    sender: PortSender,
    pending: PendingTable,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl BridgeClient {
    /// Attach to a port. Must be called from within a Tokio runtime.
    pub fn new(port: MessagePort) -> Self {
        let (sender, receiver) = port.split();
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let dispatcher = tokio::spawn(dispatch_replies(receiver, pending.clone(), closed.clone()));

        Self {
            sender,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            dispatcher,
        }
    }

    /// Invoke `kind` on the other side and wait for its reply.
    pub async fn call(&self, kind: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::ChannelClosed);
            }
            pending.insert(
                id,
                PendingCall {
                    kind: kind.to_string(),
                    reply: tx,
                },
            );
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let message = serde_json::to_value(BridgeMessage::request(kind, id, args))?;
        if !self.sender.post(message) {
            return Err(BridgeError::ChannelClosed);
        }
        debug!(id, kind, "Bridge call issued");

        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(message)) => Err(BridgeError::Host(message)),
            Err(_) => Err(BridgeError::ChannelClosed),
        }
    }

    /// [`BridgeClient::call`] with the reply decoded into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        kind: &str,
        args: Vec<Value>,
    ) -> Result<T, BridgeError> {
        let data = self.call(kind, args).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_replies(mut receiver: PortReceiver, pending: PendingTable, closed: Arc<AtomicBool>) {
    while let Some(raw) = receiver.recv().await {
        let message: BridgeMessage = match serde_json::from_value(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed bridge message");
                continue;
            }
        };
        if message.is_request() {
            debug!(kind = %message.kind, "Ignoring request on the reply path");
            continue;
        }

        let id = message.id();
        let call = {
            let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.get(&id) {
                Some(call) if call.kind == message.kind => pending.remove(&id),
                _ => None,
            }
        };

        match call {
            // The caller may have given up in the meantime.
            Some(call) => {
                let _ = call.reply.send(message.into_outcome());
            }
            None => debug!(id, kind = %message.kind, "Dropping unmatched bridge reply"),
        }
    }

    // Reject everything still waiting; the closed flag stops new entries.
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    closed.store(true, Ordering::SeqCst);
    let orphaned = pending.len();
    pending.clear();
    if orphaned > 0 {
        warn!(orphaned, "Bridge channel closed with calls outstanding");
    }
}
