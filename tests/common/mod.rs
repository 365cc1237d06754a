#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flashd::adapters::{SimulatedBackend, SimulatedController, SimulatedHost};
use flashd::archive::{MemorySource, RangeSource};
use flashd::config::AppConfig;
use flashd::context::AppContext;
use flashd::core::build::{BuildRequest, BuildService, BuildStatus};
use flashd::core::{FlashJob, Orchestrator};
use flashd::error::FlashError;
use flate2::Crc;
use flate2::write::DeflateEncoder;

/// Builds ZIP archives in memory.
#[derive(Default)]
pub struct ZipBuilder {
    entries: Vec<(String, Vec<u8>, bool)>,
    comment: Vec<u8>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(mut self, name: &str, content: &[u8]) -> Self {
        self.entries.push((name.to_string(), content.to_vec(), false));
        self
    }

    pub fn deflated(mut self, name: &str, content: &[u8]) -> Self {
        self.entries.push((name.to_string(), content.to_vec(), true));
        self
    }

    pub fn dir(mut self, name: &str) -> Self {
        self.entries.push((name.to_string(), Vec::new(), false));
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for (name, content, deflate) in &self.entries {
            let mut crc = Crc::new();
            crc.update(content);
            let (method, data): (u16, Vec<u8>) = if *deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(content).unwrap();
                (8, encoder.finish().unwrap())
            } else {
                (0, content.clone())
            };
            let offset = out.len() as u32;

            out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&method.to_le_bytes());
            out.extend_from_slice(&[0; 4]);
            out.extend_from_slice(&crc.sum().to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(content.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&data);

            central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
            central.extend_from_slice(&20u16.to_le_bytes());
            central.extend_from_slice(&20u16.to_le_bytes());
            central.extend_from_slice(&0u16.to_le_bytes());
            central.extend_from_slice(&method.to_le_bytes());
            central.extend_from_slice(&[0; 4]);
            central.extend_from_slice(&crc.sum().to_le_bytes());
            central.extend_from_slice(&(data.len() as u32).to_le_bytes());
            central.extend_from_slice(&(content.len() as u32).to_le_bytes());
            central.extend_from_slice(&(name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0; 12]);
            central.extend_from_slice(&offset.to_le_bytes());
            central.extend_from_slice(name.as_bytes());
        }

        let directory_offset = out.len() as u32;
        out.extend_from_slice(&central);

        let count = self.entries.len() as u16;
        out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&(central.len() as u32).to_le_bytes());
        out.extend_from_slice(&directory_offset.to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.comment);
        out
    }
}

/// Deterministic, poorly compressible bytes.
pub fn payload(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// A release archive with metadata, a target image and its bootloader.
pub fn release_archive(image: &[u8], bootloader: &[u8]) -> Vec<u8> {
    ZipBuilder::new()
        .deflated(
            "fw.json",
            br#"{"targets":[["RadioMaster TX16S","tx16s-"],["Jumper T-Pro","tpro-"]]}"#,
        )
        .stored("tx16s-a1b2c3d.bin", image)
        .stored("bootloader/tx16s-a1b2c3d.bin", bootloader)
        .stored("tpro-a1b2c3d.bin", &payload(2048, 9))
        .build()
}

pub struct NoBuilds;

#[async_trait::async_trait]
impl BuildService for NoBuilds {
    async fn request_build(&self, _request: &BuildRequest) -> Result<BuildStatus, FlashError> {
        Err(FlashError::Connection("no build service".to_string()))
    }

    async fn build_status(&self, request: &BuildRequest) -> Result<BuildStatus, FlashError> {
        self.request_build(request).await
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub controller: SimulatedController,
    pub source: Arc<MemorySource>,
    pub host: Arc<SimulatedHost>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        transfer_size: 1024,
        reconnect_timeout_secs: 2,
        reconnect_poll_ms: 20,
        build_poll_secs: 0,
        ..AppConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(MemorySource::new(), Arc::new(NoBuilds))
}

/// The host is called directly, without a bridge in between.
pub fn harness_with(source: MemorySource, builds: Arc<dyn BuildService>) -> Harness {
    let (backend, controller) = SimulatedBackend::new();
    let devices = Arc::new(backend);
    let host = Arc::new(SimulatedHost::new(devices.clone(), None));
    let source = Arc::new(source);
    let range_source: Arc<dyn RangeSource> = source.clone();

    let ctx = AppContext::new(test_config(), devices, host.clone(), range_source, builds);
    Harness {
        orchestrator: Orchestrator::new(ctx),
        controller,
        source,
        host,
    }
}

/// Wait until `job_id` satisfies `done`, returning that state.
pub async fn wait_for(
    orchestrator: &Orchestrator,
    job_id: &str,
    done: impl Fn(&FlashJob) -> bool,
) -> FlashJob {
    let mut rx = orchestrator.subscribe(job_id).await.expect("job exists");
    let wait = async {
        loop {
            let job = rx.borrow_and_update().clone();
            if done(&job) {
                return job;
            }
            rx.changed().await.expect("job was dropped");
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for job")
}

pub async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> FlashJob {
    wait_for(orchestrator, job_id, FlashJob::is_terminal).await
}

/// Wait for the job task itself to finish, after the job became terminal.
pub async fn wait_idle(orchestrator: &Orchestrator) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.running_jobs() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job task did not finish");
}
