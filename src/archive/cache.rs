//! Per-URL cache of opened archives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::ProgressFn;
use super::reader::{RemoteArchive, Target};
use super::source::RangeSource;
use crate::error::FlashError;

type Slot = Arc<OnceCell<Arc<RemoteArchive>>>;

#[derive(Default)]
struct CacheState {
    slots: HashMap<String, Slot>,
    /// Least recently used first.
    order: VecDeque<String>,
}

impl CacheState {
    fn touch(&mut self, url: &str) {
        if let Some(pos) = self.order.iter().position(|u| u == url) {
            self.order.remove(pos);
        }
        self.order.push_back(url.to_string());
    }

    fn remove(&mut self, url: &str) {
        self.slots.remove(url);
        self.order.retain(|u| u != url);
    }
}

/// Bounded LRU of archive indexes.
///
/// Concurrent callers for one URL share a single load. A slot is only ever
/// observed empty-and-loading or fully populated; a failed load, or a later
/// failure that makes the index suspect, removes it so the next call starts over.
pub struct ArchiveCache {
    source: Arc<dyn RangeSource>,
    metadata_entry: String,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl ArchiveCache {
    pub fn new(source: Arc<dyn RangeSource>, metadata_entry: impl Into<String>, capacity: usize) -> Self {
        Self {
            source,
            metadata_entry: metadata_entry.into(),
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn source(&self) -> &Arc<dyn RangeSource> {
        &self.source
    }

    fn slot(&self, url: &str) -> Slot {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = state.slots.entry(url.to_string()).or_default().clone();
        state.touch(url);

        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                debug!(url = %oldest, "Evicting least recently used archive");
                state.slots.remove(&oldest);
            }
        }
        slot
    }

    /// Remove `url` only if it still maps to `slot`.
    fn evict_slot(&self, url: &str, slot: &Slot) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.slots.get(url).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            state.remove(url);
        }
    }

    pub async fn open(&self, url: &str) -> Result<Arc<RemoteArchive>, FlashError> {
        let slot = self.slot(url);
        let result = slot
            .get_or_try_init(|| async {
                RemoteArchive::open(self.source.clone(), url, &self.metadata_entry)
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned();

        if let Err(err) = &result {
            warn!(url, error = %err, "Failed to open archive");
            self.evict_slot(url, &slot);
        }
        result
    }

    pub async fn list_targets(&self, url: &str) -> Result<Vec<Target>, FlashError> {
        let archive = self.open(url).await?;
        archive
            .list_targets()
            .await
            .inspect_err(|err| self.evict_on_poison(url, err))
    }

    pub async fn fetch_entry(
        &self,
        url: &str,
        name: &str,
        progress: &ProgressFn<'_>,
    ) -> Result<Vec<u8>, FlashError> {
        let archive = self.open(url).await?;
        archive
            .fetch_entry(name, progress)
            .await
            .inspect_err(|err| self.evict_on_poison(url, err))
    }

    fn evict_on_poison(&self, url: &str, err: &FlashError) {
        if err.poisons_archive() {
            warn!(url, error = %err, "Evicting archive after failure");
            self.evict(url);
        }
    }

    pub fn evict(&self, url: &str) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, url: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .contains_key(url)
    }
}
