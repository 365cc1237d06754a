use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::firmware::{AssetSelector, FirmwareSelector};
use crate::error::ErrorKind;

/// One discrete phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    Connect,
    Build,
    Download,
    EraseBootloader,
    FlashBootloader,
    Reboot,
    Erase,
    Flash,
}

/// State of a remotely executing stage (a cloud build).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalStatus {
    pub status_code: String,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageState {
    pub started: bool,
    pub completed: bool,
    pub progress: u8,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub external_status: Option<ExternalStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub kind: StageKind,
    #[serde(flatten)]
    pub state: StageState,
}

/// A transition requested by the orchestrator for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageUpdate {
    Started,
    Progress(u8),
    External(ExternalStatus),
    Completed,
    Failed { kind: ErrorKind, message: String },
}

/// What a job installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobSelector {
    Firmware(FirmwareSelector),
    Assets(AssetSelector),
}

impl JobSelector {
    /// Fixed stage order for this kind of job.
    pub fn stages(&self) -> Vec<StageKind> {
        use StageKind::*;
        match self {
            JobSelector::Firmware(FirmwareSelector::Release {
                flash_bootloader: true,
                ..
            }) => vec![
                Connect,
                Download,
                EraseBootloader,
                FlashBootloader,
                Reboot,
                Erase,
                Flash,
            ],
            JobSelector::Firmware(FirmwareSelector::Release { .. }) => {
                vec![Connect, Download, Erase, Flash]
            }
            JobSelector::Firmware(FirmwareSelector::Build { .. }) => {
                vec![Connect, Build, Erase, Flash]
            }
            JobSelector::Firmware(FirmwareSelector::Local { .. }) => vec![Connect, Erase, Flash],
            JobSelector::Assets(_) => vec![Connect, Download, Erase, Flash],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    pub selector: JobSelector,
    /// Device id for firmware jobs, directory id for asset jobs.
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashJob {
    pub id: String,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub meta: JobMeta,
    pub stages: Vec<Stage>,
}

impl FlashJob {
    pub fn new(id: String, meta: JobMeta) -> Self {
        let stages = meta
            .selector
            .stages()
            .into_iter()
            .map(|kind| Stage {
                kind,
                state: StageState::default(),
            })
            .collect();

        Self {
            id,
            cancelled: false,
            created_at: Utc::now(),
            meta,
            stages,
        }
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageState> {
        self.stages
            .iter()
            .find(|stage| stage.kind == kind)
            .map(|stage| &stage.state)
    }

    pub fn failed_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.state.error.is_some())
    }

    pub fn is_completed(&self) -> bool {
        self.stages.iter().all(|stage| stage.state.completed)
    }

    /// Cancelled, failed and completed jobs accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        self.cancelled || self.failed_stage().is_some() || self.is_completed()
    }

    /// Apply a stage transition, returning whether the job changed.
    ///
    /// Transitions on a terminal job, out-of-order starts and updates to
    /// finished stages are rejected.
    pub fn apply(&mut self, kind: StageKind, update: StageUpdate) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(index) = self.stages.iter().position(|stage| stage.kind == kind) else {
            return false;
        };
        let predecessors_done = self.stages[..index]
            .iter()
            .all(|stage| stage.state.completed);
        let state = &mut self.stages[index].state;

        match update {
            StageUpdate::Started => {
                if state.started || !predecessors_done {
                    return false;
                }
                state.started = true;
                true
            }
            StageUpdate::Progress(progress) => {
                let progress = progress.min(100);
                if !state.started || state.completed || state.progress == progress {
                    return false;
                }
                state.progress = progress;
                true
            }
            StageUpdate::External(status) => {
                if !state.started || state.completed {
                    return false;
                }
                if state.external_status.as_ref() == Some(&status) {
                    return false;
                }
                state.external_status = Some(status);
                true
            }
            StageUpdate::Completed => {
                if !state.started || state.completed {
                    return false;
                }
                state.completed = true;
                state.progress = 100;
                state.error = None;
                state.error_kind = None;
                true
            }
            StageUpdate::Failed { kind, message } => {
                // A stage may fail before its own start event (e.g. while clearing device status).
                if state.completed || !predecessors_done {
                    return false;
                }
                state.started = true;
                state.error = Some(message);
                state.error_kind = Some(kind);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release_job() -> FlashJob {
        FlashJob::new(
            "job-1".to_string(),
            JobMeta {
                selector: JobSelector::Firmware(FirmwareSelector::Release {
                    archive_url: "https://example.com/fw.zip".to_string(),
                    target: "tx16s".to_string(),
                    flash_bootloader: false,
                }),
                device_id: "dev-1".to_string(),
            },
        )
    }

    #[test]
    fn stage_order_depends_on_selector() {
        let job = release_job();
        let kinds: Vec<_> = job.stages.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Connect,
                StageKind::Download,
                StageKind::Erase,
                StageKind::Flash
            ]
        );

        let local = JobSelector::Firmware(FirmwareSelector::Local {
            path: "fw.bin".into(),
        });
        assert_eq!(
            local.stages(),
            vec![StageKind::Connect, StageKind::Erase, StageKind::Flash]
        );
    }

    #[test]
    fn later_stage_cannot_start_before_prior_completes() {
        let mut job = release_job();
        assert!(!job.apply(StageKind::Download, StageUpdate::Started));

        assert!(job.apply(StageKind::Connect, StageUpdate::Started));
        assert!(!job.apply(StageKind::Download, StageUpdate::Started));
        assert!(job.apply(StageKind::Connect, StageUpdate::Completed));
        assert!(job.apply(StageKind::Download, StageUpdate::Started));
    }

    #[test]
    fn stage_cannot_complete_before_start() {
        let mut job = release_job();
        assert!(!job.apply(StageKind::Connect, StageUpdate::Completed));
        assert!(!job.stage(StageKind::Connect).unwrap().completed);
    }

    #[test]
    fn failure_halts_the_job() {
        let mut job = release_job();
        job.apply(StageKind::Connect, StageUpdate::Started);
        assert!(job.apply(
            StageKind::Connect,
            StageUpdate::Failed {
                kind: ErrorKind::Connection,
                message: "no interfaces".to_string(),
            }
        ));

        assert!(job.is_terminal());
        assert!(!job.apply(StageKind::Connect, StageUpdate::Completed));
        assert_eq!(job.failed_stage().unwrap().kind, StageKind::Connect);
    }

    #[test]
    fn cancelled_job_is_absorbing() {
        let mut job = release_job();
        job.apply(StageKind::Connect, StageUpdate::Started);
        job.cancelled = true;

        assert!(!job.apply(StageKind::Connect, StageUpdate::Progress(50)));
        assert!(!job.apply(StageKind::Connect, StageUpdate::Completed));
        assert_eq!(job.stage(StageKind::Connect).unwrap().progress, 0);
    }

    #[test]
    fn completing_every_stage_makes_job_terminal() {
        let mut job = release_job();
        for kind in job.meta.selector.stages() {
            assert!(job.apply(kind, StageUpdate::Started));
            assert!(job.apply(kind, StageUpdate::Completed));
        }
        assert!(job.is_completed());
        assert!(job.is_terminal());
    }

    #[test]
    fn stage_serializes_flat_camel_case() {
        let job = release_job();
        let json = serde_json::to_value(&job.stages[0]).unwrap();
        assert_eq!(json["kind"], "connect");
        assert_eq!(json["started"], false);
        assert!(json.get("externalStatus").is_some());
    }
}
