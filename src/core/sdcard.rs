//! Asset installation onto a writable directory (an SD card root).

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::archive::{ProgressFn, RemoteArchive};
use crate::error::FlashError;

fn storage(context: &str, path: &Path, err: std::io::Error) -> FlashError {
    FlashError::Storage(format!("{context} {}: {err}", path.display()))
}

/// Remove everything inside `dir`, keeping the directory itself.
pub async fn clear_directory(dir: &Path, progress: &ProgressFn<'_>) -> Result<(), FlashError> {
    let mut children = Vec::new();
    let mut listing = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| storage("failed to list", dir, e))?;
    while let Some(child) = listing
        .next_entry()
        .await
        .map_err(|e| storage("failed to list", dir, e))?
    {
        children.push(child);
    }

    let total = children.len().max(1);
    for (done, child) in children.iter().enumerate() {
        let path = child.path();
        let file_type = child
            .file_type()
            .await
            .map_err(|e| storage("failed to inspect", &path, e))?;
        let removed = if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| storage("failed to remove", &path, e))?;
        progress((((done + 1) * 100) / total) as u8);
    }

    debug!(dir = %dir.display(), removed = children.len(), "Cleared directory");
    progress(100);
    Ok(())
}

/// Resolve an archive entry name below `root`, refusing anything that escapes it.
fn destination(root: &Path, name: &str) -> Result<PathBuf, FlashError> {
    let relative = Path::new(name);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || name.is_empty() {
        return Err(FlashError::Storage(format!(
            "refusing to extract unsafe entry name {name:?}"
        )));
    }
    Ok(root.join(relative))
}

/// Write every entry of `archive` below `dir`. Progress is by uncompressed bytes.
pub async fn extract_archive(
    archive: &RemoteArchive,
    dir: &Path,
    progress: &ProgressFn<'_>,
) -> Result<u64, FlashError> {
    let total: u64 = archive
        .entries()
        .iter()
        .map(|e| e.uncompressed_size)
        .sum::<u64>()
        .max(1);
    let mut written = 0u64;

    for entry in archive.entries() {
        let target = destination(dir, &entry.name)?;
        if entry.is_dir() {
            tokio::fs::create_dir_all(&target)
                .await
                .map_err(|e| storage("failed to create", &target, e))?;
            continue;
        }

        let content = archive.fetch_entry(&entry.name, &|_: u8| {}).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage("failed to create", parent, e))?;
        }
        tokio::fs::write(&target, &content)
            .await
            .map_err(|e| storage("failed to write", &target, e))?;

        written += content.len() as u64;
        progress(((written.min(total) * 100) / total) as u8);
    }

    info!(dir = %dir.display(), entries = archive.entries().len(), bytes = written, "Assets extracted");
    Ok(written)
}
