//! Device sessions on top of a DFU protocol backend.
//!
//! The wire protocol itself lives behind [`DfuBackend`] / [`DfuLink`]. This
//! module owns what the orchestrator needs on top of it: one exclusive
//! [`DeviceSession`] per open device, phase-attributed error events, and the
//! bounded reconnect probe used after unlock and reboot.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, ErrorKind, FlashError};

/// Opaque handle to a physical device, as granted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHandle {
    pub id: String,
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// USB id filter used when asking the host for device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFilter {
    pub vendor_id: u16,
    #[serde(default)]
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn matches(&self, handle: &DeviceHandle) -> bool {
        handle.vendor_id == self.vendor_id
            && self.product_id.is_none_or(|pid| pid == handle.product_id)
    }
}

/// STM32 system bootloader in DFU mode.
pub const STM32_DFU: DeviceFilter = DeviceFilter {
    vendor_id: 0x0483,
    product_id: Some(0xdf11),
};

/// GD32 / AT32 bootloaders.
pub const GD32_DFU: DeviceFilter = DeviceFilter {
    vendor_id: 0x28e9,
    product_id: Some(0x0189),
};

pub fn default_filters() -> Vec<DeviceFilter> {
    vec![STM32_DFU, GD32_DFU]
}

/// A DFU interface / alternate setting found while enumerating descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfuInterface {
    pub interface: u8,
    pub alt_setting: u8,
    pub name: String,
}

/// Which pass of a write was active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WritePhase {
    Erase,
    Write,
}

/// Ordered progress of a session write. Byte counts are cumulative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    EraseStart,
    EraseProcess(u64),
    EraseEnd,
    WriteStart,
    WriteProcess(u64),
    WriteEnd,
    End,
    Error {
        phase: WritePhase,
        kind: ErrorKind,
        message: String,
    },
}

/// An open connection provided by the device-protocol library.
#[async_trait]
pub trait DfuLink: Send {
    /// DFU interfaces enumerated by name when the link was opened.
    fn interfaces(&self) -> &[DfuInterface];

    /// Whether the device reports read-out / write protection.
    async fn is_protected(&mut self) -> Result<bool, DeviceError>;

    async fn is_error(&mut self) -> Result<bool, DeviceError>;

    async fn clear_status(&mut self) -> Result<(), DeviceError>;

    /// Erase then write `data`, sending progress events (never `End` or
    /// `Error`, those are emitted by the session from the returned result).
    async fn write(
        &mut self,
        transfer_size: u16,
        data: &[u8],
        events: mpsc::Sender<WriteEvent>,
    ) -> Result<(), DeviceError>;

    /// Vendor unlock sequence. The device usually drops off the bus and
    /// re-enumerates, which surfaces as [`DeviceError::Disconnected`].
    async fn unprotect(&mut self) -> Result<(), DeviceError>;

    /// Leave DFU and restart the device.
    async fn reboot(&mut self) -> Result<(), DeviceError>;

    async fn close(&mut self) -> Result<(), DeviceError>;
}

/// Device-protocol library entry point.
#[async_trait]
pub trait DfuBackend: Send + Sync {
    /// Devices currently enumerated on the bus.
    async fn list_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError>;

    async fn connect(&self, handle: &DeviceHandle) -> Result<Box<dyn DfuLink>, DeviceError>;
}

/// Bounded wait used when a device is expected to disconnect and come back.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// One live, exclusive connection to a flashable device.
pub struct DeviceSession {
    handle: DeviceHandle,
    link: Box<dyn DfuLink>,
    protected: bool,
    closed: bool,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("handle", &self.handle)
            .field("protected", &self.protected)
            .field("closed", &self.closed)
            .finish()
    }
}

impl DeviceSession {
    /// Open the device and probe its protection state.
    ///
    /// Fails with a connection error when the device exposes no DFU interfaces.
    pub async fn connect(
        backend: &dyn DfuBackend,
        handle: DeviceHandle,
    ) -> Result<Self, FlashError> {
        let mut session = Self::open(backend, handle).await?;
        match session.probe().await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Open the link without probing it.
    ///
    /// The session must be [`probe`](Self::probe)d before writing. Callers
    /// that can be cancelled store it first so it is always closed.
    pub async fn open(backend: &dyn DfuBackend, handle: DeviceHandle) -> Result<Self, FlashError> {
        let link = backend.connect(&handle).await?;
        Ok(Self {
            handle,
            link,
            protected: false,
            closed: false,
        })
    }

    /// Check for DFU interfaces and read the protection state.
    ///
    /// Leaves the session open on failure.
    pub async fn probe(&mut self) -> Result<(), FlashError> {
        if self.link.interfaces().is_empty() {
            return Err(DeviceError::NoInterfaces.into());
        }
        self.protected = self.link.is_protected().await?;

        info!(
            device = %self.handle.id,
            interfaces = self.link.interfaces().len(),
            protected = self.protected,
            "Device session opened"
        );
        Ok(())
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn interfaces(&self) -> &[DfuInterface] {
        self.link.interfaces()
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Erase then write `data`, forwarding progress to `events`.
    ///
    /// On success the last event is `End`. On failure the last event is an
    /// `Error` attributed to whichever phase was active when it fired.
    pub async fn write(
        &mut self,
        transfer_size: u16,
        data: &[u8],
        events: mpsc::Sender<WriteEvent>,
    ) -> Result<(), FlashError> {
        if self.closed {
            let err = FlashError::from(DeviceError::Disconnected);
            let _ = events.send(self.error_event(WritePhase::Erase, &err)).await;
            return Err(err);
        }

        let mut phase = WritePhase::Erase;

        if let Err(e) = self.prepare().await {
            let err = self.attribute(phase, e);
            let _ = events.send(self.error_event(phase, &err)).await;
            return Err(err);
        }

        let (raw_tx, mut raw_rx) = mpsc::channel(64);
        let result = {
            let write = self.link.write(transfer_size, data, raw_tx);
            tokio::pin!(write);

            let result = loop {
                tokio::select! {
                    biased;
                    Some(event) = raw_rx.recv() => {
                        forward(&mut phase, event, &events).await;
                    }
                    result = &mut write => break result,
                }
            };
            while let Ok(event) = raw_rx.try_recv() {
                forward(&mut phase, event, &events).await;
            }
            result
        };

        match result {
            Ok(()) => {
                let _ = events.send(WriteEvent::End).await;
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.handle.id, ?phase, error = %e, "Device write failed");
                let err = self.attribute(phase, e);
                let _ = events.send(self.error_event(phase, &err)).await;
                Err(err)
            }
        }
    }

    /// Issue the vendor unlock sequence.
    ///
    /// A disconnect while unlocking is the expected outcome and counts as
    /// success; callers confirm with [`wait_for_reconnect`].
    pub async fn force_unprotect(&mut self) -> Result<(), FlashError> {
        info!(device = %self.handle.id, "Removing flash protection");
        match self.link.unprotect().await {
            Ok(()) | Err(DeviceError::Disconnected) => {
                self.protected = false;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Restart the device. A disconnect during reboot is expected.
    pub async fn reboot(&mut self) -> Result<(), FlashError> {
        info!(device = %self.handle.id, "Rebooting device");
        match self.link.reboot().await {
            Ok(()) | Err(DeviceError::Disconnected) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the device handle. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.link.close().await {
            debug!(device = %self.handle.id, error = %e, "Error while closing device");
        }
        debug!(device = %self.handle.id, "Device session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn prepare(&mut self) -> Result<(), DeviceError> {
        if self.link.is_error().await? {
            debug!(device = %self.handle.id, "Clearing device error status");
            self.link.clear_status().await?;
        }
        Ok(())
    }

    fn attribute(&self, phase: WritePhase, err: DeviceError) -> FlashError {
        match err {
            DeviceError::Status(message) if phase == WritePhase::Erase && self.protected => {
                FlashError::DeviceLocked(message)
            }
            other => other.into(),
        }
    }

    fn error_event(&self, phase: WritePhase, err: &FlashError) -> WriteEvent {
        WriteEvent::Error {
            phase,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!(device = %self.handle.id, "Device session dropped without close");
        }
    }
}

async fn forward(phase: &mut WritePhase, event: WriteEvent, events: &mpsc::Sender<WriteEvent>) {
    match event {
        WriteEvent::EraseStart | WriteEvent::EraseProcess(_) | WriteEvent::EraseEnd => {
            *phase = WritePhase::Erase;
        }
        WriteEvent::WriteStart | WriteEvent::WriteProcess(_) | WriteEvent::WriteEnd => {
            *phase = WritePhase::Write;
        }
        // Terminal events belong to the session, not the link.
        WriteEvent::End | WriteEvent::Error { .. } => return,
    }
    let _ = events.send(event).await;
}

/// Wait for `device_id` to re-enumerate after an expected disconnect.
///
/// The first probe happens one poll interval after the call so a device that
/// has not dropped off yet is not mistaken for one that came back.
pub async fn wait_for_reconnect(
    backend: &dyn DfuBackend,
    device_id: &str,
    policy: ReconnectPolicy,
) -> Result<DeviceHandle, FlashError> {
    let deadline = tokio::time::Instant::now() + policy.timeout;
    info!(device = %device_id, timeout = ?policy.timeout, "Waiting for device to reconnect");

    loop {
        tokio::time::sleep(policy.poll_interval).await;

        match backend.list_devices().await {
            Ok(devices) => {
                if let Some(handle) = devices.into_iter().find(|d| d.id == device_id) {
                    info!(device = %device_id, "Device reconnected");
                    return Ok(handle);
                }
            }
            Err(e) => debug!(device = %device_id, error = %e, "Device enumeration failed"),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(DeviceError::ReconnectTimeout {
                id: device_id.to_string(),
                timeout: policy.timeout,
            }
            .into());
        }
    }
}
