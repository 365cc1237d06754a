use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::core::device::{
    DeviceHandle, DfuBackend, DfuInterface, DfuLink, STM32_DFU, WriteEvent, WritePhase,
};
use crate::error::DeviceError;

/// Failure injected into a simulated write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Device reports an error status once erase progress reaches `at_percent`.
    Erase { at_percent: u8, message: String },
    /// Device reports an error status once write progress reaches `at_percent`.
    Write { at_percent: u8, message: String },
    /// Device drops off the bus mid-operation.
    Disconnect { phase: WritePhase, at_percent: u8 },
}

/// A fake radio in DFU mode.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub handle: DeviceHandle,
    pub interfaces: Vec<DfuInterface>,
    pub protected: bool,
    pub fault: Option<Fault>,
    /// Delay per transferred chunk, to make progress observable.
    pub chunk_delay: Duration,
    /// How long the device stays off the bus after unlock or reboot.
    pub reenumerate_after: Duration,
    /// Time taken to read the option bytes when probing protection.
    pub probe_delay: Duration,
}

impl SimulatedDevice {
    pub fn new(id: &str) -> Self {
        Self {
            handle: DeviceHandle {
                id: id.to_string(),
                name: format!("STM32 BOOTLOADER {id}"),
                vendor_id: STM32_DFU.vendor_id,
                product_id: STM32_DFU.product_id.unwrap_or(0xdf11),
            },
            interfaces: vec![DfuInterface {
                interface: 0,
                alt_setting: 0,
                name: "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg".to_string(),
            }],
            protected: false,
            fault: None,
            chunk_delay: Duration::ZERO,
            reenumerate_after: Duration::from_millis(50),
            probe_delay: Duration::ZERO,
        }
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn without_interfaces(mut self) -> Self {
        self.interfaces.clear();
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }
}

#[derive(Default)]
struct SimState {
    devices: HashMap<String, SimulatedDevice>,
    /// Devices temporarily off the bus.
    hidden_until: HashMap<String, Instant>,
    /// Images written per device, in order.
    flashed: HashMap<String, Vec<Vec<u8>>>,
    open_sessions: HashMap<String, usize>,
    connects: HashMap<String, usize>,
}

impl SimState {
    fn visible(&self, id: &str) -> Option<&SimulatedDevice> {
        let hidden = self
            .hidden_until
            .get(id)
            .is_some_and(|until| Instant::now() < *until);
        if hidden {
            return None;
        }
        self.devices.get(id)
    }
}

type Shared = Arc<Mutex<SimState>>;

fn lock(state: &Shared) -> std::sync::MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives the simulated bus from tests or the daemon's stdin console.
#[derive(Clone)]
pub struct SimulatedController {
    state: Shared,
}

impl SimulatedController {
    pub fn add_device(&self, id: &str) {
        self.add(SimulatedDevice::new(id));
    }

    pub fn add(&self, device: SimulatedDevice) {
        debug!(device = %device.handle.id, "Simulated device attached");
        lock(&self.state)
            .devices
            .insert(device.handle.id.clone(), device);
    }

    pub fn remove_device(&self, id: &str) {
        debug!(device = %id, "Simulated device detached");
        lock(&self.state).devices.remove(id);
    }

    pub fn set_fault(&self, id: &str, fault: Option<Fault>) {
        if let Some(device) = lock(&self.state).devices.get_mut(id) {
            device.fault = fault;
        }
    }

    pub fn set_protected(&self, id: &str, protected: bool) {
        if let Some(device) = lock(&self.state).devices.get_mut(id) {
            device.protected = protected;
        }
    }

    pub fn is_protected(&self, id: &str) -> Option<bool> {
        lock(&self.state).devices.get(id).map(|d| d.protected)
    }

    /// Images successfully written to `id`, oldest first.
    pub fn flashed(&self, id: &str) -> Vec<Vec<u8>> {
        lock(&self.state).flashed.get(id).cloned().unwrap_or_default()
    }

    /// Links to `id` that have not been closed.
    pub fn open_sessions(&self, id: &str) -> usize {
        lock(&self.state).open_sessions.get(id).copied().unwrap_or(0)
    }

    pub fn connect_count(&self, id: &str) -> usize {
        lock(&self.state).connects.get(id).copied().unwrap_or(0)
    }
}

/// In-process [`DfuBackend`] with scriptable devices.
pub struct SimulatedBackend {
    state: Shared,
}

impl SimulatedBackend {
    pub fn new() -> (Self, SimulatedController) {
        let state: Shared = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: state.clone(),
            },
            SimulatedController { state },
        )
    }
}

#[async_trait]
impl DfuBackend for SimulatedBackend {
    async fn list_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError> {
        let state = lock(&self.state);
        let mut devices: Vec<DeviceHandle> = state
            .devices
            .keys()
            .filter_map(|id| state.visible(id))
            .map(|d| d.handle.clone())
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn connect(&self, handle: &DeviceHandle) -> Result<Box<dyn DfuLink>, DeviceError> {
        let mut state = lock(&self.state);
        let interfaces = state
            .visible(&handle.id)
            .map(|d| d.interfaces.clone())
            .ok_or_else(|| DeviceError::NotFound(handle.id.clone()))?;

        *state.open_sessions.entry(handle.id.clone()).or_default() += 1;
        *state.connects.entry(handle.id.clone()).or_default() += 1;

        Ok(Box::new(SimulatedLink {
            id: handle.id.clone(),
            state: self.state.clone(),
            interfaces,
            error_status: false,
            closed: false,
        }))
    }
}

struct SimulatedLink {
    id: String,
    state: Shared,
    interfaces: Vec<DfuInterface>,
    error_status: bool,
    closed: bool,
}

impl SimulatedLink {
    fn device(&self) -> Result<SimulatedDevice, DeviceError> {
        if self.closed {
            return Err(DeviceError::Disconnected);
        }
        lock(&self.state)
            .visible(&self.id)
            .cloned()
            .ok_or(DeviceError::Disconnected)
    }

    /// Take the device off the bus for its re-enumeration delay.
    fn drop_off_bus(&self, delay: Duration) {
        lock(&self.state)
            .hidden_until
            .insert(self.id.clone(), Instant::now() + delay);
    }

    async fn pass(
        &mut self,
        phase: WritePhase,
        transfer_size: u16,
        total: u64,
        events: &mpsc::Sender<WriteEvent>,
    ) -> Result<(), DeviceError> {
        let chunk = u64::from(transfer_size.max(1));
        let mut done = 0u64;

        while done < total {
            let device = self.device()?;
            if !device.chunk_delay.is_zero() {
                tokio::time::sleep(device.chunk_delay).await;
            }
            done = (done + chunk).min(total);
            let event = match phase {
                WritePhase::Erase => WriteEvent::EraseProcess(done),
                WritePhase::Write => WriteEvent::WriteProcess(done),
            };
            let _ = events.send(event).await;

            let reached = (done * 100 / total) as u8;
            match &device.fault {
                Some(Fault::Erase { at_percent, message })
                    if phase == WritePhase::Erase && reached >= *at_percent =>
                {
                    return Err(DeviceError::Status(message.clone()));
                }
                Some(Fault::Write { at_percent, message })
                    if phase == WritePhase::Write && reached >= *at_percent =>
                {
                    return Err(DeviceError::Status(message.clone()));
                }
                Some(Fault::Disconnect {
                    phase: at_phase,
                    at_percent,
                }) if *at_phase == phase && reached >= *at_percent => {
                    self.closed = true;
                    return Err(DeviceError::Disconnected);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn run_write(
        &mut self,
        transfer_size: u16,
        data: &[u8],
        events: &mpsc::Sender<WriteEvent>,
    ) -> Result<(), DeviceError> {
        let total = data.len() as u64;

        let _ = events.send(WriteEvent::EraseStart).await;
        if self.device()?.protected {
            return Err(DeviceError::Status("flash protected".to_string()));
        }
        self.pass(WritePhase::Erase, transfer_size, total, events)
            .await?;
        let _ = events.send(WriteEvent::EraseEnd).await;

        let _ = events.send(WriteEvent::WriteStart).await;
        self.pass(WritePhase::Write, transfer_size, total, events)
            .await?;
        let _ = events.send(WriteEvent::WriteEnd).await;

        lock(&self.state)
            .flashed
            .entry(self.id.clone())
            .or_default()
            .push(data.to_vec());
        Ok(())
    }
}

#[async_trait]
impl DfuLink for SimulatedLink {
    fn interfaces(&self) -> &[DfuInterface] {
        &self.interfaces
    }

    async fn is_protected(&mut self) -> Result<bool, DeviceError> {
        let delay = self.device()?.probe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.device()?.protected)
    }

    async fn is_error(&mut self) -> Result<bool, DeviceError> {
        self.device()?;
        Ok(self.error_status)
    }

    async fn clear_status(&mut self) -> Result<(), DeviceError> {
        self.device()?;
        self.error_status = false;
        Ok(())
    }

    async fn write(
        &mut self,
        transfer_size: u16,
        data: &[u8],
        events: mpsc::Sender<WriteEvent>,
    ) -> Result<(), DeviceError> {
        let result = self.run_write(transfer_size, data, &events).await;
        if matches!(result, Err(DeviceError::Status(_))) {
            self.error_status = true;
        }
        result
    }

    async fn unprotect(&mut self) -> Result<(), DeviceError> {
        let delay = self.device()?.reenumerate_after;
        if let Some(device) = lock(&self.state).devices.get_mut(&self.id) {
            device.protected = false;
        }
        self.drop_off_bus(delay);
        self.closed = true;
        Err(DeviceError::Disconnected)
    }

    async fn reboot(&mut self) -> Result<(), DeviceError> {
        let delay = self.device()?.reenumerate_after;
        self.drop_off_bus(delay);
        self.closed = true;
        Err(DeviceError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if let Some(open) = state.open_sessions.get_mut(&self.id) {
            *open = open.saturating_sub(1);
        }
        Ok(())
    }
}
