//! Request/response calls across an isolated message channel.
//!
//! The orchestrator runs on the worker side and reaches host-only operations
//! (device and directory permission prompts) through a [`BridgeClient`]. The
//! privileged side runs a [`BridgeHost`] that answers each request exactly once.

pub mod capabilities;
pub mod channel;
pub mod client;
pub mod host;
pub mod protocol;

pub use capabilities::{
    DeviceRequest, DirectoryHandle, HostCapabilities, REQUEST_DEVICE, REQUEST_DIRECTORY,
    RemoteHost, serve_capabilities,
};
pub use channel::{MessagePort, channel};
pub use client::BridgeClient;
pub use host::{BridgeHost, HostOperation};
pub use protocol::BridgeMessage;
