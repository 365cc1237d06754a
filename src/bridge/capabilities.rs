//! Host-only operations reachable through the bridge.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::channel::MessagePort;
use super::client::BridgeClient;
use super::host::BridgeHost;
use crate::core::device::{DeviceFilter, DeviceHandle};
use crate::error::BridgeError;

pub const REQUEST_DEVICE: &str = "requestDevice";
pub const REQUEST_DIRECTORY: &str = "requestDirectory";

/// Ask the host for access to a device matching `filters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub filters: Vec<DeviceFilter>,
    /// Preferred device, when the caller already knows which one it wants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// A writable directory granted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryHandle {
    pub id: String,
    pub path: PathBuf,
}

/// Operations that need the privileged context (permission prompts).
#[async_trait]
pub trait HostCapabilities: Send + Sync {
    async fn request_device(&self, request: DeviceRequest) -> Result<DeviceHandle, BridgeError>;

    async fn request_directory(
        &self,
        directory_id: Option<String>,
    ) -> Result<DirectoryHandle, BridgeError>;
}

/// [`HostCapabilities`] implemented by calls across a bridge port.
pub struct RemoteHost {
    client: BridgeClient,
}

impl RemoteHost {
    pub fn new(port: MessagePort) -> Self {
        Self {
            client: BridgeClient::new(port),
        }
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }
}

#[async_trait]
impl HostCapabilities for RemoteHost {
    async fn request_device(&self, request: DeviceRequest) -> Result<DeviceHandle, BridgeError> {
        self.client
            .call_as(REQUEST_DEVICE, vec![serde_json::to_value(request)?])
            .await
    }

    async fn request_directory(
        &self,
        directory_id: Option<String>,
    ) -> Result<DirectoryHandle, BridgeError> {
        self.client
            .call_as(REQUEST_DIRECTORY, vec![serde_json::to_value(directory_id)?])
            .await
    }
}

fn first_arg<T: DeserializeOwned>(args: Vec<Value>) -> anyhow::Result<T> {
    let value = args.into_iter().next().unwrap_or(Value::Null);
    serde_json::from_value(value).context("invalid bridge call arguments")
}

/// Build a host listener exposing `capabilities` under the standard operation names.
pub fn serve_capabilities(capabilities: Arc<dyn HostCapabilities>) -> BridgeHost {
    let devices = capabilities.clone();
    let directories = capabilities;

    BridgeHost::new()
        .register_fn(REQUEST_DEVICE, move |args| {
            let capabilities = devices.clone();
            async move {
                let request: DeviceRequest = first_arg(args)?;
                let handle = capabilities.request_device(request).await?;
                anyhow::Ok(serde_json::to_value(handle)?)
            }
        })
        .register_fn(REQUEST_DIRECTORY, move |args| {
            let capabilities = directories.clone();
            async move {
                let directory_id: Option<String> = first_arg(args)?;
                let handle = capabilities.request_directory(directory_id).await?;
                anyhow::Ok(serde_json::to_value(handle)?)
            }
        })
}
