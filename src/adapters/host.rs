use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::bridge::{DeviceRequest, DirectoryHandle, HostCapabilities};
use crate::core::device::{DeviceHandle, DfuBackend};
use crate::error::BridgeError;

/// Host capabilities that grant every request without prompting.
///
/// Devices are picked from the backend by filter and preferred id. Directories
/// come from an explicit table, falling back to a default directory.
pub struct SimulatedHost {
    devices: Arc<dyn DfuBackend>,
    directories: Mutex<HashMap<String, PathBuf>>,
    default_directory: Option<PathBuf>,
    device_requests: AtomicUsize,
}

impl SimulatedHost {
    pub fn new(devices: Arc<dyn DfuBackend>, default_directory: Option<PathBuf>) -> Self {
        Self {
            devices,
            directories: Mutex::new(HashMap::new()),
            default_directory,
            device_requests: AtomicUsize::new(0),
        }
    }

    pub fn add_directory(&self, id: impl Into<String>, path: impl Into<PathBuf>) {
        self.directories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), path.into());
    }

    /// How many device prompts the host has answered.
    pub fn device_requests(&self) -> usize {
        self.device_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostCapabilities for SimulatedHost {
    async fn request_device(&self, request: DeviceRequest) -> Result<DeviceHandle, BridgeError> {
        self.device_requests.fetch_add(1, Ordering::SeqCst);
        let devices = self
            .devices
            .list_devices()
            .await
            .map_err(|e| BridgeError::Host(e.to_string()))?;

        let granted = devices.into_iter().find(|device| {
            request.filters.iter().any(|f| f.matches(device))
                && request.device_id.as_ref().is_none_or(|id| *id == device.id)
        });

        match granted {
            Some(device) => {
                debug!(device = %device.id, "Device access granted");
                Ok(device)
            }
            None => Err(BridgeError::Host("no device selected".to_string())),
        }
    }

    async fn request_directory(
        &self,
        directory_id: Option<String>,
    ) -> Result<DirectoryHandle, BridgeError> {
        let known = directory_id.as_ref().and_then(|id| {
            self.directories
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(id)
                .cloned()
        });

        let path = known
            .or_else(|| self.default_directory.clone())
            .ok_or_else(|| BridgeError::Host("no directory selected".to_string()))?;
        Ok(DirectoryHandle {
            id: directory_id.unwrap_or_else(|| "default".to_string()),
            path,
        })
    }
}
