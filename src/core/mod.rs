pub mod build;
pub mod device;
pub mod firmware;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod sdcard;

pub use device::{DeviceHandle, DeviceSession, DfuBackend, DfuLink};
pub use firmware::{AssetSelector, FirmwareSelector};
pub use models::{FlashJob, JobMeta, JobSelector, Stage, StageKind, StageState, StageUpdate};
pub use orchestrator::Orchestrator;
pub use registry::JobRegistry;
