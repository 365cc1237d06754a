//! Entry-level access to a ZIP archive behind a [`RangeSource`].

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::ProgressFn;
use super::source::{ByteProgress, RangeSource};
use super::zip::{self, EndOfCentralDirectory, MAX_TAIL_LEN, ZipEntry};
use crate::error::{AcquisitionError, FlashError};

/// Enough for the EOCD record of archives without a long comment.
const INITIAL_TAIL_LEN: u64 = 4096;

/// A buildable target listed in the archive metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
struct ArchiveMetadata {
    #[serde(default)]
    targets: Vec<(String, String)>,
}

/// Parsed central directory of one archive plus lazily fetched contents.
pub struct RemoteArchive {
    source: Arc<dyn RangeSource>,
    url: String,
    content_length: u64,
    entries: Vec<ZipEntry>,
    /// Sorted local header offsets followed by the directory offset.
    boundaries: Vec<u64>,
    directory_offset: u64,
    metadata_entry: String,
    /// The whole archive, when it had to be (or already was) downloaded.
    backing: OnceCell<Arc<Vec<u8>>>,
    targets: OnceCell<Vec<Target>>,
}

impl std::fmt::Debug for RemoteArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteArchive")
            .field("url", &self.url)
            .field("content_length", &self.content_length)
            .field("entries", &self.entries.len())
            .field("in_memory", &self.backing.initialized())
            .finish()
    }
}

impl RemoteArchive {
    /// Probe `url` and read its central directory.
    pub async fn open(
        source: Arc<dyn RangeSource>,
        url: &str,
        metadata_entry: &str,
    ) -> Result<Self, FlashError> {
        let info = source.probe(url).await?;

        if !info.accepts_ranges {
            info!(url, "Source ignores byte ranges, downloading whole archive");
            let data = source.fetch_all(url, None).await?;
            return Self::from_bytes(source, url, metadata_entry, data);
        }

        let length = info.content_length;
        let mut tail_len = INITIAL_TAIL_LEN.min(length);
        let (tail, eocd) = loop {
            let start = length - tail_len;
            let Some(tail) = source.fetch_range(url, start..length, None).await? else {
                let data = source.fetch_all(url, None).await?;
                return Self::from_bytes(source, url, metadata_entry, data);
            };
            match zip::find_eocd(&tail) {
                Ok(eocd) => break (tail, eocd),
                Err(err) => {
                    let widest = MAX_TAIL_LEN.min(length);
                    if tail_len >= widest {
                        return Err(err.into());
                    }
                    tail_len = widest;
                }
            }
        };

        let tail_start = length - tail_len;
        if tail_start == 0 {
            return Self::from_bytes(source, url, metadata_entry, tail);
        }

        let dir = directory_range(&eocd);
        if dir.end > length {
            return Err(AcquisitionError::InvalidArchive(
                "central directory runs past end of archive".to_string(),
            )
            .into());
        }

        let entries = if dir.start >= tail_start {
            let at = (dir.start - tail_start) as usize;
            zip::parse_central_directory(&tail[at..], eocd.entries)?
        } else {
            match source.fetch_range(url, dir.clone(), None).await? {
                Some(data) => zip::parse_central_directory(&data, eocd.entries)?,
                None => {
                    let data = source.fetch_all(url, None).await?;
                    return Self::from_bytes(source, url, metadata_entry, data);
                }
            }
        };

        debug!(url, entries = entries.len(), length, "Read central directory");
        Ok(Self::assemble(
            source,
            url,
            metadata_entry,
            length,
            entries,
            eocd.directory_offset,
            OnceCell::new(),
        ))
    }

    fn from_bytes(
        source: Arc<dyn RangeSource>,
        url: &str,
        metadata_entry: &str,
        data: Vec<u8>,
    ) -> Result<Self, FlashError> {
        let eocd = zip::find_eocd(&data)?;
        let dir = directory_range(&eocd);
        if dir.end > data.len() as u64 {
            return Err(AcquisitionError::InvalidArchive(
                "central directory runs past end of archive".to_string(),
            )
            .into());
        }
        let entries = zip::parse_central_directory(
            &data[dir.start as usize..dir.end as usize],
            eocd.entries,
        )?;

        let length = data.len() as u64;
        Ok(Self::assemble(
            source,
            url,
            metadata_entry,
            length,
            entries,
            eocd.directory_offset,
            OnceCell::new_with(Some(Arc::new(data))),
        ))
    }

    fn assemble(
        source: Arc<dyn RangeSource>,
        url: &str,
        metadata_entry: &str,
        content_length: u64,
        entries: Vec<ZipEntry>,
        directory_offset: u64,
        backing: OnceCell<Arc<Vec<u8>>>,
    ) -> Self {
        let mut boundaries: Vec<u64> = entries.iter().map(|e| e.offset).collect();
        boundaries.push(directory_offset);
        boundaries.sort_unstable();
        boundaries.dedup();

        Self {
            source,
            url: url.to_string(),
            content_length,
            entries,
            boundaries,
            directory_offset,
            metadata_entry: metadata_entry.to_string(),
            backing,
            targets: OnceCell::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// Targets named by the metadata entry. Parsed once per archive.
    pub async fn list_targets(&self) -> Result<Vec<Target>, FlashError> {
        self.targets
            .get_or_try_init(|| async {
                if zip::find_entry(&self.entries, &self.metadata_entry).is_none() {
                    return Err(FlashError::from(AcquisitionError::MetadataMissing {
                        url: self.url.clone(),
                    }));
                }
                let raw = self.fetch_entry(&self.metadata_entry, &|_: u8| {}).await?;
                let metadata: ArchiveMetadata = serde_json::from_slice(&raw)
                    .map_err(|e| AcquisitionError::InvalidMetadata(e.to_string()))?;

                Ok::<_, FlashError>(
                    metadata
                        .targets
                        .into_iter()
                        .map(|(name, code)| Target {
                            name,
                            code: code.trim_end_matches('-').to_string(),
                        })
                        .collect(),
                )
            })
            .await
            .cloned()
    }

    /// Fetch and decode one entry, matching `{name}-{hash}.bin` when there
    /// is no exact match. `progress` receives a percentage of the transfer.
    pub async fn fetch_entry(
        &self,
        name: &str,
        progress: &ProgressFn<'_>,
    ) -> Result<Vec<u8>, FlashError> {
        let entry =
            zip::find_entry(&self.entries, name).ok_or_else(|| AcquisitionError::EntryNotFound {
                name: name.to_string(),
            })?;
        let span = self.span_of(entry);

        let total = (span.end - span.start).max(1);
        let report = |received: u64| progress((received.min(total) * 100 / total) as u8);
        let raw = self.read(span, &report).await?;

        let content = zip::decode_entry(entry, &raw)?;
        debug!(url = %self.url, entry = %entry.name, bytes = content.len(), "Fetched entry");
        Ok(content)
    }

    /// From the local header up to the next record.
    fn span_of(&self, entry: &ZipEntry) -> Range<u64> {
        let end = self
            .boundaries
            .iter()
            .copied()
            .find(|&o| o > entry.offset)
            .unwrap_or(self.directory_offset);
        entry.offset..end
    }

    async fn read(&self, range: Range<u64>, progress: &ByteProgress<'_>) -> Result<Vec<u8>, FlashError> {
        if let Some(data) = self.backing.get() {
            progress(range.end - range.start);
            return slice(data, range);
        }

        if let Some(bytes) = self
            .source
            .fetch_range(&self.url, range.clone(), Some(progress))
            .await?
        {
            return Ok(bytes);
        }

        info!(url = %self.url, "Range request ignored, falling back to full download");
        let data = self
            .backing
            .get_or_try_init(|| async {
                self.source
                    .fetch_all(&self.url, None)
                    .await
                    .map(Arc::new)
            })
            .await?;
        progress(range.end - range.start);
        slice(data, range)
    }
}

fn directory_range(eocd: &EndOfCentralDirectory) -> Range<u64> {
    eocd.directory_offset..eocd.directory_offset + eocd.directory_size
}

fn slice(data: &[u8], range: Range<u64>) -> Result<Vec<u8>, FlashError> {
    data.get(range.start as usize..range.end as usize)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            AcquisitionError::InvalidArchive("entry lies outside the archive".to_string()).into()
        })
}
