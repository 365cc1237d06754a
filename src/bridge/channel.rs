//! Structured-message port pairs.
//!
//! Ports carry plain JSON values only, the same way a message channel between
//! isolated execution contexts would. Nothing but data crosses a port.

use serde_json::Value;
use tokio::sync::mpsc;

/// Create two connected ports. Messages posted on one arrive on the other.
pub fn channel() -> (MessagePort, MessagePort) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MessagePort {
            sender: PortSender { tx: a_tx },
            receiver: PortReceiver { rx: b_rx },
        },
        MessagePort {
            sender: PortSender { tx: b_tx },
            receiver: PortReceiver { rx: a_rx },
        },
    )
}

/// One end of a bidirectional channel.
#[derive(Debug)]
pub struct MessagePort {
    sender: PortSender,
    receiver: PortReceiver,
}

impl MessagePort {
    /// Post a message. Returns `false` if the other end is gone.
    pub fn post(&self, message: Value) -> bool {
        self.sender.post(message)
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl PortSender {
    pub fn post(&self, message: Value) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl PortReceiver {
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}
