//! Remote build-on-demand service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::models::ExternalStatus;
use crate::error::{FlashError, TransportError};

/// A compile-time option passed to the remote build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFlag {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub release: String,
    pub target: String,
    pub flags: Vec<BuildFlag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildState {
    Queued,
    Building,
    Success { artifact_url: String },
    Failed { message: String },
}

/// Status of a remote build as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStatus {
    pub status_code: String,
    pub started_at: Option<DateTime<Utc>>,
    pub state: BuildState,
}

impl BuildStatus {
    pub fn external(&self) -> ExternalStatus {
        ExternalStatus {
            status_code: self.status_code.clone(),
            started_at: self.started_at,
        }
    }
}

#[async_trait]
pub trait BuildService: Send + Sync {
    /// Trigger (or join) a build for the request.
    async fn request_build(&self, request: &BuildRequest) -> Result<BuildStatus, FlashError>;

    /// Current status of a previously requested build.
    async fn build_status(&self, request: &BuildRequest) -> Result<BuildStatus, FlashError>;
}

/// Client for the cloud build HTTP API.
pub struct CloudBuild {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CloudBuildJob {
    status: String,
    #[serde(default)]
    build_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    artifacts: Vec<CloudBuildArtifact>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudBuildArtifact {
    download_url: String,
}

impl CloudBuild {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::Client)?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(&self, path: &str, request: &BuildRequest) -> Result<BuildStatus, FlashError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                url,
                status: response.status().as_u16(),
            }
            .into());
        }

        let job: CloudBuildJob = response
            .json()
            .await
            .map_err(|source| TransportError::Request { url, source })?;

        Ok(job.into_status())
    }
}

impl CloudBuildJob {
    fn into_status(self) -> BuildStatus {
        let state = match self.status.as_str() {
            "BUILD_SUCCESS" => match self.artifacts.into_iter().next() {
                Some(artifact) => BuildState::Success {
                    artifact_url: artifact.download_url,
                },
                None => BuildState::Failed {
                    message: "build succeeded without an artifact".to_string(),
                },
            },
            "BUILD_ERROR" => BuildState::Failed {
                message: self.error.unwrap_or_else(|| "build error".to_string()),
            },
            "BUILD_IN_PROGRESS" => BuildState::Building,
            _ => BuildState::Queued,
        };

        BuildStatus {
            status_code: self.status,
            started_at: self.build_started_at,
            state,
        }
    }
}

#[async_trait]
impl BuildService for CloudBuild {
    async fn request_build(&self, request: &BuildRequest) -> Result<BuildStatus, FlashError> {
        self.post("jobs", request).await
    }

    async fn build_status(&self, request: &BuildRequest) -> Result<BuildStatus, FlashError> {
        self.post("status", request).await
    }
}
