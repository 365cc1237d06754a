//! Error taxonomy shared by the orchestrator, the archive reader and the bridge.
//!
//! Every [`FlashError`] maps onto an [`ErrorKind`] which is recorded next to the
//! message on a failed stage, so observers can tell a locked device apart from a
//! generic failure without parsing text.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes exposed on failed stages and RPC errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    DeviceBusy,
    DeviceLocked,
    Device,
    Acquisition,
    Transport,
    Storage,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum FlashError {
    /// No compatible interfaces, lost connection, or the device could not be resolved.
    #[error("{0}")]
    Connection(String),

    #[error("device {0} is busy with another job")]
    DeviceBusy(String),

    /// Flash is read-protected; recoverable through `unprotect_device`.
    #[error("{0}")]
    DeviceLocked(String),

    /// The device reported a failure while erasing or writing.
    #[error("{0}")]
    Device(String),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Storage(String),

    #[error("job was cancelled")]
    Cancelled,
}

impl FlashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::Connection(_) => ErrorKind::Connection,
            FlashError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            FlashError::DeviceLocked(_) => ErrorKind::DeviceLocked,
            FlashError::Device(_) => ErrorKind::Device,
            FlashError::Acquisition(_) => ErrorKind::Acquisition,
            FlashError::Transport(_) => ErrorKind::Transport,
            FlashError::Storage(_) => ErrorKind::Storage,
            FlashError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Errors after which a cached archive index must not be reused.
    pub fn poisons_archive(&self) -> bool {
        match self {
            FlashError::Transport(_) => true,
            FlashError::Acquisition(err) => !matches!(err, AcquisitionError::EntryNotFound { .. }),
            _ => false,
        }
    }
}

/// Archive, metadata, build and local-file failures.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("archive {url} has no metadata entry")]
    MetadataMissing { url: String },

    #[error("invalid archive metadata: {0}")]
    InvalidMetadata(String),

    #[error("no archive entry matches {name}")]
    EntryNotFound { name: String },

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("entry {name} uses unsupported compression method {method}")]
    UnsupportedCompression { name: String, method: u16 },

    #[error("entry {name} failed its CRC-32 check")]
    IntegrityMismatch { name: String },

    #[error("remote build failed: {0}")]
    BuildFailed(String),

    #[error("remote build did not finish within {0:?}")]
    BuildTimeout(Duration),

    #[error("failed to read firmware file {path}: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Network failures, kept apart from protocol-level archive errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("no resource at {0}")]
    NotFound(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Failures reported by a device-protocol backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device exposes no compatible DFU interfaces")]
    NoInterfaces,

    #[error("device connection lost")]
    Disconnected,

    #[error("device {0} not found")]
    NotFound(String),

    /// Error status reported by the device itself, e.g. "flash protected".
    #[error("{0}")]
    Status(String),

    #[error("device {id} did not re-enumerate within {timeout:?}")]
    ReconnectTimeout { id: String, timeout: Duration },
}

impl From<DeviceError> for FlashError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Status(message) => FlashError::Device(message),
            other => FlashError::Connection(other.to_string()),
        }
    }
}

/// Cross-boundary call failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge channel closed")]
    ChannelClosed,

    /// Failure raised by the privileged side; only the message survives the channel.
    #[error("{0}")]
    Host(String),

    #[error("invalid bridge payload: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_status_maps_to_device_kind() {
        let err: FlashError = DeviceError::Status("flash protected".into()).into();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(err.to_string(), "flash protected");
    }

    #[test]
    fn lost_connection_maps_to_connection_kind() {
        let err: FlashError = DeviceError::Disconnected.into();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(err.to_string(), "device connection lost");
    }

    #[test]
    fn entry_not_found_does_not_poison_archive() {
        let missing = FlashError::from(AcquisitionError::EntryNotFound { name: "x".into() });
        let metadata = FlashError::from(AcquisitionError::MetadataMissing { url: "u".into() });
        assert!(!missing.poisons_archive());
        assert!(metadata.poisons_archive());
        assert!(!FlashError::Cancelled.poisons_archive());
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DeviceLocked).unwrap();
        assert_eq!(json, r#""device_locked""#);
    }
}
