//! In-memory registry of flash jobs.
//!
//! Each job lives behind a `watch` channel so observers can read a snapshot
//! and then subscribe to every later change (poll-then-subscribe). Only the
//! orchestrator mutates entries, and every mutation goes through
//! [`FlashJob::apply`], which rejects transitions on cancelled or finished jobs.
//! Late events from in-flight work are therefore no-ops.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};

use super::models::{FlashJob, StageKind, StageUpdate};

/// Thread-safe store of live and finished jobs, shared via `AppContext`.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<HashMap<String, watch::Sender<FlashJob>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new job and return a receiver following its updates.
    pub async fn insert(&self, job: FlashJob) -> watch::Receiver<FlashJob> {
        let id = job.id.clone();
        let (tx, rx) = watch::channel(job);
        let mut map = self.inner.write().await;
        map.insert(id, tx);
        rx
    }

    /// Apply a stage transition. Returns false if the job is unknown or the
    /// transition was rejected.
    pub async fn apply(&self, job_id: &str, kind: StageKind, update: StageUpdate) -> bool {
        let map = self.inner.read().await;
        match map.get(job_id) {
            Some(tx) => tx.send_if_modified(|job| job.apply(kind, update)),
            None => false,
        }
    }

    /// Mark a job cancelled. Returns false if the job is unknown.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let map = self.inner.read().await;
        match map.get(job_id) {
            Some(tx) => {
                tx.send_if_modified(|job| {
                    if job.cancelled {
                        return false;
                    }
                    job.cancelled = true;
                    true
                });
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<FlashJob> {
        let map = self.inner.read().await;
        map.get(job_id).map(|tx| tx.borrow().clone())
    }

    pub async fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<FlashJob>> {
        let map = self.inner.read().await;
        map.get(job_id).map(|tx| tx.subscribe())
    }

    /// Remove a job from the registry (dismissal).
    pub async fn remove(&self, job_id: &str) -> Option<FlashJob> {
        let mut map = self.inner.write().await;
        map.remove(job_id).map(|tx| tx.borrow().clone())
    }

    /// Snapshot of every registered job, oldest first.
    pub async fn get_all(&self) -> Vec<FlashJob> {
        let map = self.inner.read().await;
        let mut jobs: Vec<FlashJob> = map.values().map(|tx| tx.borrow().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Number of jobs that have not reached a terminal state.
    /// Jobs still retained, terminal ones included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Jobs that are not terminal yet.
    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|tx| !tx.borrow().is_terminal()).count()
    }
}
