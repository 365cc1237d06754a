//! Device and host adapters.
//!
//! Only the simulated bus ships today; hardware DFU access plugs in behind the
//! same [`DfuBackend`] trait.

use std::sync::Arc;

use anyhow::bail;
use tracing::{info, warn};

use crate::bridge::{self, HostCapabilities, RemoteHost, serve_capabilities};
use crate::config::AppConfig;
use crate::core::device::DfuBackend;

pub mod host;
pub mod simulated;

pub use host::SimulatedHost;
pub use simulated::{Fault, SimulatedBackend, SimulatedController, SimulatedDevice};

pub struct Adapters {
    pub devices: Arc<dyn DfuBackend>,
    /// Host capabilities as seen from the orchestrator, i.e. across the bridge.
    pub host: Arc<dyn HostCapabilities>,
    pub controller: Option<SimulatedController>,
}

/// Build the device backend and wire host capabilities through a bridge.
///
/// Must be called from within a Tokio runtime.
pub fn get_adapters(config: &AppConfig) -> anyhow::Result<Adapters> {
    if !config.simulation {
        bail!("no hardware DFU backend is available in this build; enable `simulation`");
    }

    let (backend, controller) = SimulatedBackend::new();
    let devices: Arc<dyn DfuBackend> = Arc::new(backend);
    let privileged = Arc::new(SimulatedHost::new(
        devices.clone(),
        config.asset_directory.clone(),
    ));

    let (worker_port, host_port) = bridge::channel();
    serve_capabilities(privileged).spawn(host_port);
    let host: Arc<dyn HostCapabilities> = Arc::new(RemoteHost::new(worker_port));

    spawn_console(controller.clone());

    Ok(Adapters {
        devices,
        host,
        controller: Some(controller),
    })
}

/// Read simulator commands from stdin.
fn spawn_console(controller: SimulatedController) {
    info!("Simulator console: add <id> | locked <id> | empty <id> | rm <id>");

    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            let parts: Vec<&str> = line.split_whitespace().collect();
            let id = parts.get(1).copied().unwrap_or("dfu-0");

            match parts.first().copied() {
                Some("add") => controller.add_device(id),
                Some("locked") => controller.add(SimulatedDevice::new(id).protected()),
                Some("empty") => controller.add(SimulatedDevice::new(id).without_interfaces()),
                Some("rm") => controller.remove_device(id),
                Some(other) => warn!(command = other, "Unknown simulator command"),
                None => {}
            }
        }
    });
}
