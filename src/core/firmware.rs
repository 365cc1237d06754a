//! Firmware selectors and acquisition helpers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::{ArchiveCache, ProgressFn};
use crate::core::build::BuildFlag;
use crate::error::{AcquisitionError, FlashError};

/// Where the firmware image of a job comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum FirmwareSelector {
    /// A target binary inside a published firmware archive.
    #[serde(rename_all = "camelCase")]
    Release {
        archive_url: String,
        target: String,
        #[serde(default)]
        flash_bootloader: bool,
    },
    /// An on-demand remote build.
    #[serde(rename_all = "camelCase")]
    Build {
        release: String,
        target: String,
        #[serde(default)]
        flags: Vec<BuildFlag>,
    },
    /// A binary uploaded from the local filesystem.
    Local { path: PathBuf },
}

/// An asset bundle installed onto removable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSelector {
    pub archive_url: String,
}

/// Images acquired for a firmware job.
#[derive(Debug, Clone, Default)]
pub struct Firmware {
    pub image: Vec<u8>,
    pub bootloader: Option<Vec<u8>>,
}

/// Archive entry name of a target's bootloader, matched as `bootloader/{target}-{hash}.bin`.
pub fn bootloader_entry(target: &str) -> String {
    format!("bootloader/{target}")
}

/// Pull the target image (and optionally its bootloader) out of a release archive.
pub async fn download_release(
    archives: &ArchiveCache,
    archive_url: &str,
    target: &str,
    with_bootloader: bool,
    progress: &ProgressFn<'_>,
) -> Result<Firmware, FlashError> {
    let bootloader = if with_bootloader {
        let entry = bootloader_entry(target);
        let silent = |_: u8| {};
        Some(archives.fetch_entry(archive_url, &entry, &silent).await?)
    } else {
        None
    };

    let image = archives.fetch_entry(archive_url, target, progress).await?;
    debug!(
        target,
        bytes = image.len(),
        bootloader = bootloader.is_some(),
        "Firmware downloaded"
    );

    Ok(Firmware { image, bootloader })
}

/// Read a locally uploaded firmware image.
pub async fn read_local(path: &Path) -> Result<Vec<u8>, FlashError> {
    let image = tokio::fs::read(path)
        .await
        .map_err(|source| AcquisitionError::LocalFile {
            path: path.to_path_buf(),
            source,
        })?;

    if image.is_empty() {
        return Err(AcquisitionError::LocalFile {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "file is empty"),
        }
        .into());
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn selector_serializes_with_source_tag() {
        let selector = FirmwareSelector::Release {
            archive_url: "https://example.com/fw.zip".to_string(),
            target: "tx16s".to_string(),
            flash_bootloader: false,
        };
        let json = serde_json::to_value(&selector).unwrap();
        assert_eq!(json["source"], "release");
        assert_eq!(json["archiveUrl"], "https://example.com/fw.zip");

        let parsed: FirmwareSelector =
            serde_json::from_str(r#"{"source":"local","path":"/tmp/fw.bin"}"#).unwrap();
        assert_eq!(
            parsed,
            FirmwareSelector::Local {
                path: "/tmp/fw.bin".into()
            }
        );
    }

    #[tokio::test]
    async fn read_local_returns_file_contents() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();

        let image = read_local(file.path()).await.unwrap();
        assert_eq!(image, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn read_local_rejects_missing_and_empty_files() {
        let err = read_local(Path::new("/nonexistent/firmware.bin"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::Acquisition(AcquisitionError::LocalFile { .. })
        ));

        let empty = NamedTempFile::new().unwrap();
        assert!(read_local(empty.path()).await.is_err());
    }
}
