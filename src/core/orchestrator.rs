//! Staged execution of flash and asset-install jobs.
//!
//! Each job runs in its own task. Stages execute strictly in the job's fixed
//! order and every transition goes through the job registry, which drops
//! anything arriving after the job was cancelled or finished. Cancelling a job
//! marks it in the registry first and then trips its token, which drops the
//! in-flight stage future; the device session is closed on every exit path.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::archive::{RemoteArchive, Target};
use crate::bridge::{DeviceRequest, DirectoryHandle};
use crate::context::AppContext;
use crate::core::build::{BuildFlag, BuildRequest, BuildState};
use crate::core::device::{
    DeviceHandle, DeviceSession, WriteEvent, WritePhase, default_filters, wait_for_reconnect,
};
use crate::core::firmware::{self, AssetSelector, Firmware, FirmwareSelector};
use crate::core::models::{FlashJob, JobMeta, JobSelector, StageKind, StageUpdate};
use crate::core::sdcard;
use crate::error::{AcquisitionError, ErrorKind, FlashError};
use crate::logging::LogThrottle;

/// Drives jobs against the devices, archives and host in an [`AppContext`].
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: AppContext,
    /// Cancellation tokens of jobs whose task is still running.
    active: Mutex<HashMap<String, CancellationToken>>,
    /// Devices and directories currently held by a job or an unlock.
    busy: Mutex<HashSet<String>>,
    /// Device handles the host has already granted.
    authorized: Mutex<HashMap<String, DeviceHandle>>,
}

/// Holds a device or directory for one job; released on drop.
struct Reservation {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.inner
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        debug!(resource = %self.key, "Released");
    }
}

/// What a spawned job task executes.
enum Plan {
    Firmware {
        selector: FirmwareSelector,
        device_id: String,
        local_image: Option<Vec<u8>>,
    },
    Assets {
        selector: AssetSelector,
        directory_id: String,
    },
}

fn directory_key(directory_id: &str) -> String {
    format!("directory:{directory_id}")
}

fn percent(done: u64, total: u64) -> u8 {
    ((done.min(total) * 100) / total.max(1)) as u8
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                active: Mutex::new(HashMap::new()),
                busy: Mutex::new(HashSet::new()),
                authorized: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.inner.ctx
    }

    /// Start a firmware job against `device_id`.
    ///
    /// Fails with [`FlashError::DeviceBusy`] while another job or unlock holds
    /// the device. A local image is read before the job is registered.
    pub async fn create_job(
        &self,
        selector: FirmwareSelector,
        device_id: &str,
    ) -> Result<String, FlashError> {
        let reservation = self.reserve(device_id)?;

        let local_image = match &selector {
            FirmwareSelector::Local { path } => Some(firmware::read_local(path).await?),
            _ => None,
        };

        let meta = JobMeta {
            selector: JobSelector::Firmware(selector.clone()),
            device_id: device_id.to_string(),
        };
        let plan = Plan::Firmware {
            selector,
            device_id: device_id.to_string(),
            local_image,
        };
        Ok(self.spawn(meta, plan, reservation).await)
    }

    /// Start an asset installation into the host directory `directory_id`.
    pub async fn create_asset_job(
        &self,
        selector: AssetSelector,
        directory_id: &str,
    ) -> Result<String, FlashError> {
        let reservation = self.reserve(&directory_key(directory_id))?;
        let meta = JobMeta {
            selector: JobSelector::Assets(selector.clone()),
            device_id: directory_id.to_string(),
        };
        let plan = Plan::Assets {
            selector,
            directory_id: directory_id.to_string(),
        };
        Ok(self.spawn(meta, plan, reservation).await)
    }

    /// Cancel a job. Returns false for unknown ids.
    ///
    /// The job is marked cancelled before its task is interrupted, so results
    /// from work that is already in flight are discarded.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        if !self.inner.ctx.jobs.cancel(job_id).await {
            return false;
        }
        let token = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
        }
        info!(job_id, "Job cancelled");
        true
    }

    /// Cancel (if still running) and forget a job.
    pub async fn dismiss_job(&self, job_id: &str) -> bool {
        self.cancel_job(job_id).await;
        let removed = self.inner.ctx.jobs.remove(job_id).await.is_some();
        if removed {
            debug!(job_id, "Job dismissed");
        }
        removed
    }

    pub async fn job(&self, job_id: &str) -> Option<FlashJob> {
        self.inner.ctx.jobs.get(job_id).await
    }

    pub async fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<FlashJob>> {
        self.inner.ctx.jobs.subscribe(job_id).await
    }

    pub async fn list_jobs(&self) -> Vec<FlashJob> {
        self.inner.ctx.jobs.get_all().await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceHandle>, FlashError> {
        Ok(self.inner.ctx.devices.list_devices().await?)
    }

    /// Targets offered by a firmware archive.
    pub async fn list_targets(&self, archive_url: &str) -> Result<Vec<Target>, FlashError> {
        self.inner.ctx.archives.list_targets(archive_url).await
    }

    /// Remove flash protection from `device_id`.
    ///
    /// Returns false when the device was not protected. Otherwise the unlock is
    /// confirmed by waiting for the device to re-enumerate unprotected.
    pub async fn unprotect_device(&self, device_id: &str) -> Result<bool, FlashError> {
        let _reservation = self.reserve(device_id)?;
        let ctx = &self.inner.ctx;
        let handle = self.inner.resolve_device(device_id).await?;

        let mut session = DeviceSession::connect(ctx.devices.as_ref(), handle).await?;
        if !session.is_protected() {
            session.close().await;
            return Ok(false);
        }
        let unlocked = session.force_unprotect().await;
        session.close().await;
        unlocked?;

        let handle =
            wait_for_reconnect(ctx.devices.as_ref(), device_id, ctx.config.reconnect_policy())
                .await?;
        let mut session = DeviceSession::connect(ctx.devices.as_ref(), handle).await?;
        let still_protected = session.is_protected();
        session.close().await;

        if still_protected {
            return Err(FlashError::Connection(format!(
                "device {device_id} is still protected after unlock"
            )));
        }
        info!(device = %device_id, "Flash protection removed");
        Ok(true)
    }

    /// Cancel every running job.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.cancel_job(&id).await;
        }
    }

    /// Number of jobs whose task is still running.
    pub fn running_jobs(&self) -> usize {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn reserve(&self, key: &str) -> Result<Reservation, FlashError> {
        let mut busy = self.inner.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(key.to_string()) {
            return Err(FlashError::DeviceBusy(key.to_string()));
        }
        Ok(Reservation {
            inner: self.inner.clone(),
            key: key.to_string(),
        })
    }

    async fn spawn(&self, meta: JobMeta, plan: Plan, reservation: Reservation) -> String {
        let id = Uuid::now_v7().to_string();
        let token = CancellationToken::new();

        self.inner.ctx.jobs.insert(FlashJob::new(id.clone(), meta)).await;
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), token.clone());

        let run = JobRun {
            inner: self.inner.clone(),
            job_id: id.clone(),
        };
        let span = info_span!("job", job_id = %id);
        tokio::spawn(run.execute(plan, token, reservation).instrument(span));

        info!(job_id = %id, "Job created");
        id
    }
}

impl Inner {
    /// Find a granted handle for `device_id`, asking the host if there is none.
    async fn resolve_device(&self, device_id: &str) -> Result<DeviceHandle, FlashError> {
        let known = self
            .authorized
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned();
        if let Some(handle) = known {
            return Ok(handle);
        }

        let request = DeviceRequest {
            filters: default_filters(),
            device_id: Some(device_id.to_string()),
        };
        let handle = self
            .ctx
            .host
            .request_device(request)
            .await
            .map_err(|e| FlashError::Connection(format!("device request failed: {e}")))?;
        if handle.id != device_id {
            return Err(FlashError::Connection(format!(
                "host granted device {} instead of {device_id}",
                handle.id
            )));
        }

        self.authorized
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id.clone(), handle.clone());
        Ok(handle)
    }
}

/// The task side of one job.
struct JobRun {
    inner: Arc<Inner>,
    job_id: String,
}

impl JobRun {
    fn ctx(&self) -> &AppContext {
        &self.inner.ctx
    }

    async fn execute(self, plan: Plan, token: CancellationToken, reservation: Reservation) {
        let mut session: Option<DeviceSession> = None;

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FlashError::Cancelled),
            result = self.run_plan(plan, &mut session) => result,
        };

        if let Some(session) = session.as_mut() {
            session.close().await;
        }
        drop(reservation);
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);

        match outcome {
            Ok(()) => info!("Job completed"),
            Err(FlashError::Cancelled) => info!("Job stopped after cancellation"),
            Err(e) => warn!(error = %e, kind = ?e.kind(), "Job failed"),
        }
    }

    async fn run_plan(
        &self,
        plan: Plan,
        session: &mut Option<DeviceSession>,
    ) -> Result<(), FlashError> {
        match plan {
            Plan::Firmware {
                selector,
                device_id,
                local_image,
            } => {
                self.run_firmware(selector, &device_id, local_image, session)
                    .await
            }
            Plan::Assets {
                selector,
                directory_id,
            } => self.run_assets(selector, &directory_id).await,
        }
    }

    async fn run_firmware(
        &self,
        selector: FirmwareSelector,
        device_id: &str,
        local_image: Option<Vec<u8>>,
        session: &mut Option<DeviceSession>,
    ) -> Result<(), FlashError> {
        // The link goes into `session` before it is probed, so `execute`
        // closes it even when the job is cancelled mid-probe.
        let session = self
            .stage(StageKind::Connect, async move {
                let handle = self.inner.resolve_device(device_id).await?;
                let opened = DeviceSession::open(self.ctx().devices.as_ref(), handle).await?;
                let session = session.insert(opened);
                session.probe().await?;
                Ok(session)
            })
            .await?;

        let firmware = match selector {
            FirmwareSelector::Release {
                archive_url,
                target,
                flash_bootloader,
            } => {
                let (progress, pump) = self.progress(StageKind::Download);
                let firmware = self
                    .stage(
                        StageKind::Download,
                        firmware::download_release(
                            &self.ctx().archives,
                            &archive_url,
                            &target,
                            flash_bootloader,
                            &progress,
                        ),
                    )
                    .await;
                drop(progress);
                let _ = pump.await;
                firmware?
            }
            FirmwareSelector::Build {
                release,
                target,
                flags,
            } => Firmware {
                image: self
                    .stage(StageKind::Build, self.remote_build(release, target, flags))
                    .await?,
                bootloader: None,
            },
            FirmwareSelector::Local { .. } => Firmware {
                image: local_image.unwrap_or_default(),
                bootloader: None,
            },
        };

        if let Some(bootloader) = &firmware.bootloader {
            self.write_image(
                session,
                StageKind::EraseBootloader,
                StageKind::FlashBootloader,
                bootloader,
            )
            .await?;
            self.stage(StageKind::Reboot, self.reboot(session)).await?;
        }

        self.write_image(session, StageKind::Erase, StageKind::Flash, &firmware.image)
            .await
    }

    async fn run_assets(&self, selector: AssetSelector, directory_id: &str) -> Result<(), FlashError> {
        let directory = self
            .stage(StageKind::Connect, self.open_directory(directory_id))
            .await?;
        let root = directory.path;

        let archive: Arc<RemoteArchive> = self
            .stage(
                StageKind::Download,
                self.ctx().archives.open(&selector.archive_url),
            )
            .await?;

        let (progress, pump) = self.progress(StageKind::Erase);
        let cleared = self
            .stage(StageKind::Erase, sdcard::clear_directory(&root, &progress))
            .await;
        drop(progress);
        let _ = pump.await;
        cleared?;

        let (progress, pump) = self.progress(StageKind::Flash);
        let extracted = self
            .stage(
                StageKind::Flash,
                sdcard::extract_archive(&archive, &root, &progress),
            )
            .await;
        drop(progress);
        let _ = pump.await;

        if let Err(e) = &extracted
            && e.poisons_archive()
        {
            self.ctx().archives.evict(&selector.archive_url);
        }
        extracted.map(|_| ())
    }

    async fn apply(&self, kind: StageKind, update: StageUpdate) -> bool {
        self.ctx().jobs.apply(&self.job_id, kind, update).await
    }

    /// Run `work` as stage `kind`: start it, then complete or fail it.
    ///
    /// A stage that cannot start (the job was cancelled or dismissed) does not run.
    async fn stage<T>(
        &self,
        kind: StageKind,
        work: impl Future<Output = Result<T, FlashError>>,
    ) -> Result<T, FlashError> {
        if !self.apply(kind, StageUpdate::Started).await {
            return Err(FlashError::Cancelled);
        }
        debug!(stage = ?kind, "Stage started");

        match work.await {
            Ok(value) => {
                self.apply(kind, StageUpdate::Completed).await;
                debug!(stage = ?kind, "Stage completed");
                Ok(value)
            }
            Err(e) => {
                self.fail(kind, &e).await;
                Err(e)
            }
        }
    }

    async fn fail(&self, kind: StageKind, err: &FlashError) {
        if matches!(err, FlashError::Cancelled) {
            return;
        }
        warn!(stage = ?kind, error = %err, "Stage failed");
        self.apply(
            kind,
            StageUpdate::Failed {
                kind: err.kind(),
                message: err.to_string(),
            },
        )
        .await;
    }

    /// A progress callback for `kind` plus the task applying its updates.
    ///
    /// The task ends once the callback is dropped.
    fn progress(&self, kind: StageKind) -> (impl Fn(u8) + Send + Sync + 'static, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let jobs = self.ctx().jobs.clone();
        let job_id = self.job_id.clone();

        let pump = tokio::spawn(async move {
            let throttle = LogThrottle::new(Duration::from_secs(1));
            while let Some(progress) = rx.recv().await {
                if jobs.apply(&job_id, kind, StageUpdate::Progress(progress)).await
                    && throttle.should_log()
                {
                    debug!(job_id = %job_id, stage = ?kind, progress, "Stage progress");
                }
            }
        });

        let report = move |progress: u8| {
            let _ = tx.send(progress);
        };
        (report, pump)
    }

    /// Erase and write `image`, driving the `erase` and `flash` stages from
    /// the session's events.
    async fn write_image(
        &self,
        session: &mut DeviceSession,
        erase: StageKind,
        flash: StageKind,
        image: &[u8],
    ) -> Result<(), FlashError> {
        let total = image.len() as u64;
        let transfer_size = self.ctx().config.transfer_size;
        let (tx, mut rx) = mpsc::channel(64);

        let write = session.write(transfer_size, image, tx);
        let apply_events = async {
            let throttle = LogThrottle::new(Duration::from_secs(1));
            while let Some(event) = rx.recv().await {
                let (stage, update) = match event {
                    WriteEvent::EraseStart => (erase, StageUpdate::Started),
                    WriteEvent::EraseProcess(n) => (erase, StageUpdate::Progress(percent(n, total))),
                    WriteEvent::EraseEnd => (erase, StageUpdate::Completed),
                    WriteEvent::WriteStart => (flash, StageUpdate::Started),
                    WriteEvent::WriteProcess(n) => (flash, StageUpdate::Progress(percent(n, total))),
                    WriteEvent::WriteEnd => continue,
                    WriteEvent::End => (flash, StageUpdate::Completed),
                    WriteEvent::Error { kind: ErrorKind::Cancelled, .. } => continue,
                    WriteEvent::Error {
                        phase,
                        kind,
                        message,
                    } => {
                        let stage = match phase {
                            WritePhase::Erase => erase,
                            WritePhase::Write => flash,
                        };
                        warn!(stage = ?stage, error = %message, "Stage failed");
                        (stage, StageUpdate::Failed { kind, message })
                    }
                };
                let progressed = matches!(update, StageUpdate::Progress(_));
                if self.apply(stage, update).await && progressed && throttle.should_log() {
                    debug!(stage = ?stage, "Write progress");
                }
            }
        };

        let (result, ()) = tokio::join!(write, apply_events);
        result
    }

    async fn reboot(&self, session: &mut DeviceSession) -> Result<(), FlashError> {
        let devices = self.ctx().devices.as_ref();
        let device_id = session.handle().id.clone();

        session.reboot().await?;
        session.close().await;

        let handle =
            wait_for_reconnect(devices, &device_id, self.ctx().config.reconnect_policy()).await?;
        *session = DeviceSession::open(devices, handle).await?;
        session.probe().await
    }

    async fn remote_build(
        &self,
        release: String,
        target: String,
        flags: Vec<BuildFlag>,
    ) -> Result<Vec<u8>, FlashError> {
        let ctx = self.ctx();
        let request = BuildRequest {
            release,
            target,
            flags,
        };
        let timeout = ctx.config.build_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut status = ctx.builds.request_build(&request).await?;
        let artifact_url = loop {
            self.apply(StageKind::Build, StageUpdate::External(status.external()))
                .await;
            match status.state {
                BuildState::Success { artifact_url } => break artifact_url,
                BuildState::Failed { message } => {
                    return Err(AcquisitionError::BuildFailed(message).into());
                }
                BuildState::Queued | BuildState::Building => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(AcquisitionError::BuildTimeout(timeout).into());
            }
            tokio::time::sleep(ctx.config.build_poll_interval()).await;
            status = ctx.builds.build_status(&request).await?;
        };

        info!(artifact = %artifact_url, "Remote build finished");
        let image = ctx.archives.source().fetch_all(&artifact_url, None).await?;
        if image.is_empty() {
            return Err(AcquisitionError::BuildFailed("build artifact is empty".to_string()).into());
        }
        Ok(image)
    }

    async fn open_directory(&self, directory_id: &str) -> Result<DirectoryHandle, FlashError> {
        let handle = self
            .ctx()
            .host
            .request_directory(Some(directory_id.to_string()))
            .await
            .map_err(|e| FlashError::Connection(format!("directory request failed: {e}")))?;

        match tokio::fs::metadata(&handle.path).await {
            Ok(meta) if meta.is_dir() => Ok(handle),
            Ok(_) => Err(FlashError::Storage(format!(
                "{} is not a directory",
                handle.path.display()
            ))),
            Err(e) => Err(FlashError::Connection(format!(
                "directory {} is not available: {e}",
                handle.path.display()
            ))),
        }
    }
}
