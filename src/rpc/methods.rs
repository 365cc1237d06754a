//! RPC method dispatch.
//!
//! `jobs.subscribe` streams and is handled by the transport; everything else
//! maps one request to one response here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tokio::sync::watch;

use crate::core::{AssetSelector, FirmwareSelector, FlashJob, Orchestrator};

use super::protocol::{Request, Response};

pub struct MethodHandler {
    orchestrator: Orchestrator,
    start_time: Instant,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobParams {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceParams {
    device_id: String,
}

fn parse<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

impl MethodHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "daemon.status" => Ok(self.daemon_status(id.clone()).await),
            "devices.list" => Ok(self.devices_list(id.clone()).await),
            "devices.unprotect" => self.devices_unprotect(id.clone(), params).await,
            "firmware.targets" => self.firmware_targets(id.clone(), params).await,
            "jobs.create" => self.jobs_create(id.clone(), params).await,
            "jobs.createAssets" => self.jobs_create_assets(id.clone(), params).await,
            "jobs.cancel" => self.jobs_cancel(id.clone(), params).await,
            "jobs.dismiss" => self.jobs_dismiss(id.clone(), params).await,
            "jobs.get" => self.jobs_get(id.clone(), params).await,
            "jobs.list" => Ok(Response::success(id.clone(), self.orchestrator.list_jobs().await)),
            _ => Ok(Response::method_not_found(id.clone(), &request.method)),
        };
        result.unwrap_or_else(|response| response)
    }

    /// Resolve the parameters of a `jobs.subscribe` call.
    ///
    /// On success the receiver yields the current job state first.
    pub async fn subscribe(
        &self,
        id: &Value,
        params: Value,
    ) -> Result<watch::Receiver<FlashJob>, Response> {
        let params: JobParams = parse(id, params)?;
        self.orchestrator
            .subscribe(&params.id)
            .await
            .ok_or_else(|| Response::job_not_found(id.clone(), &params.id))
    }

    async fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            running_jobs: usize,
            tracked_jobs: usize,
            active_jobs: usize,
            cached_archives: usize,
            rpc_bind: String,
            simulation: bool,
        }

        let ctx = self.orchestrator.context();
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.start_time.elapsed().as_secs(),
                running_jobs: self.orchestrator.running_jobs(),
                tracked_jobs: ctx.jobs.len().await,
                active_jobs: ctx.jobs.active_count().await,
                cached_archives: ctx.archives.len(),
                rpc_bind: ctx.config.rpc_bind.to_string(),
                simulation: ctx.config.simulation,
            },
        )
    }

    async fn devices_list(&self, id: Value) -> Response {
        match self.orchestrator.list_devices().await {
            Ok(devices) => Response::success(id, devices),
            Err(e) => Response::flash_error(id, &e),
        }
    }

    async fn devices_unprotect(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: DeviceParams = parse(&id, params)?;

        #[derive(Serialize)]
        struct Unprotected {
            unprotected: bool,
        }

        Ok(match self.orchestrator.unprotect_device(&params.device_id).await {
            Ok(unprotected) => Response::success(id, Unprotected { unprotected }),
            Err(e) => Response::flash_error(id, &e),
        })
    }

    async fn firmware_targets(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            archive_url: String,
        }
        let params: Params = parse(&id, params)?;

        Ok(match self.orchestrator.list_targets(&params.archive_url).await {
            Ok(targets) => Response::success(id, targets),
            Err(e) => Response::flash_error(id, &e),
        })
    }

    async fn jobs_create(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            device_id: String,
            firmware: FirmwareSelector,
        }
        let params: Params = parse(&id, params)?;

        Ok(
            match self
                .orchestrator
                .create_job(params.firmware, &params.device_id)
                .await
            {
                Ok(job_id) => Response::success(id, JobCreated { id: job_id }),
                Err(e) => Response::flash_error(id, &e),
            },
        )
    }

    async fn jobs_create_assets(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            directory_id: String,
            #[serde(flatten)]
            assets: AssetSelector,
        }
        let params: Params = parse(&id, params)?;

        Ok(
            match self
                .orchestrator
                .create_asset_job(params.assets, &params.directory_id)
                .await
            {
                Ok(job_id) => Response::success(id, JobCreated { id: job_id }),
                Err(e) => Response::flash_error(id, &e),
            },
        )
    }

    async fn jobs_cancel(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobParams = parse(&id, params)?;
        Ok(if self.orchestrator.cancel_job(&params.id).await {
            Response::success(id, true)
        } else {
            Response::job_not_found(id, &params.id)
        })
    }

    async fn jobs_dismiss(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobParams = parse(&id, params)?;
        Ok(if self.orchestrator.dismiss_job(&params.id).await {
            Response::success(id, true)
        } else {
            Response::job_not_found(id, &params.id)
        })
    }

    async fn jobs_get(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobParams = parse(&id, params)?;
        Ok(match self.orchestrator.job(&params.id).await {
            Some(job) => Response::success(id, job),
            None => Response::job_not_found(id, &params.id),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobCreated {
    pub id: String,
}
