use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use flashd::adapters::get_adapters;
use flashd::archive::{HttpSource, MemorySource, RangeSource, RemoteArchive};
use flashd::config::AppConfig;
use flashd::context::AppContext;
use flashd::core::build::{BuildFlag, CloudBuild};
use flashd::core::{FirmwareSelector, FlashJob, Orchestrator, StageKind};
use flashd::logging::{self, LogConfig};
use flashd::rpc::{JobCreated, RpcClient, RpcServer};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

#[derive(Parser)]
#[command(name = "flashd")]
#[command(about = "Radio firmware flashing and SD asset daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of ./flashd.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Daemon(ServerArgs),
    /// Show daemon status
    Status,
    /// List connected DFU devices
    Devices,
    /// List the targets of a firmware archive (URL or local .zip)
    Targets { archive: String },
    /// Flash firmware onto a device and follow the job
    Flash(FlashArgs),
    /// Install an asset archive into a host directory and follow the job
    Install {
        #[arg(long)]
        directory: String,
        archive_url: String,
    },
    /// Follow a job until it finishes
    Watch { job_id: String },
    Cancel { job_id: String },
    Dismiss { job_id: String },
    /// Remove read protection from a device
    Unprotect { device_id: String },
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    asset_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    build_service_url: Option<String>,
}

#[derive(Args)]
struct FlashArgs {
    #[arg(long)]
    device: String,

    /// Firmware release archive
    #[arg(long, conflicts_with_all = ["file", "build"], requires = "target")]
    archive_url: Option<String>,

    /// Request a remote build of this release
    #[arg(long, conflicts_with = "file", requires = "target")]
    build: Option<String>,

    /// Flash a local binary
    #[arg(long)]
    file: Option<PathBuf>,

    #[arg(long)]
    target: Option<String>,

    /// Also flash the matching bootloader (release archives only)
    #[arg(long)]
    bootloader: bool,

    /// Build flags as NAME=VALUE
    #[arg(long = "flag", value_parser = parse_flag)]
    flags: Vec<BuildFlag>,
}

fn parse_flag(raw: &str) -> Result<BuildFlag, String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw}"))?;
    Ok(BuildFlag {
        name: name.to_string(),
        value: value.to_string(),
    })
}

impl FlashArgs {
    fn selector(&self) -> Result<FirmwareSelector> {
        let target = self.target.clone().unwrap_or_default();
        if let Some(archive_url) = &self.archive_url {
            return Ok(FirmwareSelector::Release {
                archive_url: archive_url.clone(),
                target,
                flash_bootloader: self.bootloader,
            });
        }
        if let Some(release) = &self.build {
            return Ok(FirmwareSelector::Build {
                release: release.clone(),
                target,
                flags: self.flags.clone(),
            });
        }
        if let Some(path) = &self.file {
            let path = std::fs::canonicalize(path)
                .with_context(|| format!("Cannot resolve {}", path.display()))?;
            return Ok(FirmwareSelector::Local { path });
        }
        bail!("one of --archive-url, --build or --file is required")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let server_args = match &cli.command {
        Commands::Daemon(args) => Some(args),
        _ => None,
    };
    let config = match &cli.config {
        Some(path) => AppConfig::load(path, server_args)?,
        None => AppConfig::new(server_args)?,
    };
    logging::init(LogConfig::from(&config))?;

    let client = RpcClient::new(config.rpc_bind);
    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Failed to start daemon")?,
        Commands::Status => print_json(client.call_no_params::<Value>("daemon.status").await?),
        Commands::Devices => print_json(client.call_no_params::<Value>("devices.list").await?),
        Commands::Targets { archive } => run_targets(&config, &client, &archive).await?,
        Commands::Flash(args) => {
            let params = json!({ "deviceId": args.device, "firmware": args.selector()? });
            let created: JobCreated = client.call("jobs.create", Some(params)).await?;
            follow(&client, &created.id).await?;
        }
        Commands::Install {
            directory,
            archive_url,
        } => {
            let params = json!({ "directoryId": directory, "archiveUrl": archive_url });
            let created: JobCreated = client.call("jobs.createAssets", Some(params)).await?;
            follow(&client, &created.id).await?;
        }
        Commands::Watch { job_id } => follow(&client, &job_id).await?,
        Commands::Cancel { job_id } => {
            client
                .call::<bool>("jobs.cancel", Some(json!({ "id": job_id })))
                .await?;
            println!("Cancelled {job_id}");
        }
        Commands::Dismiss { job_id } => {
            client
                .call::<bool>("jobs.dismiss", Some(json!({ "id": job_id })))
                .await?;
            println!("Dismissed {job_id}");
        }
        Commands::Unprotect { device_id } => print_json(
            client
                .call::<Value>("devices.unprotect", Some(json!({ "deviceId": device_id })))
                .await?,
        ),
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let adapters = get_adapters(&config)?;
    let source: Arc<dyn RangeSource> = Arc::new(HttpSource::new(config.http_timeout())?);
    let builds = Arc::new(CloudBuild::new(
        config.build_service_url.clone(),
        config.http_timeout(),
    )?);
    let bind = config.rpc_bind;

    let ctx = AppContext::new(config, adapters.devices, adapters.host, source, builds);
    let orchestrator = Orchestrator::new(ctx);
    let server = RpcServer::new(orchestrator.clone(), bind);

    info!("flashd started");
    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.shutdown();
            orchestrator.shutdown().await;
        }
    }
    Ok(())
}

/// Local archives are read directly; URLs go through the daemon's cache.
async fn run_targets(config: &AppConfig, client: &RpcClient, archive: &str) -> Result<()> {
    if archive.starts_with("http://") || archive.starts_with("https://") {
        let targets: Value = client
            .call("firmware.targets", Some(json!({ "archiveUrl": archive })))
            .await?;
        print_json(targets);
        return Ok(());
    }

    let bytes = tokio::fs::read(archive)
        .await
        .with_context(|| format!("Failed to read {archive}"))?;
    let source = MemorySource::new();
    source.insert(archive, bytes);
    let opened = RemoteArchive::open(Arc::new(source), archive, &config.metadata_entry).await?;
    print_json(serde_json::to_value(opened.list_targets().await?)?);
    Ok(())
}

async fn follow(client: &RpcClient, job_id: &str) -> Result<()> {
    println!("Job {job_id}");
    let mut last: Option<(StageKind, u8)> = None;

    let job = client
        .watch_job(job_id, |job| {
            let Some(stage) = job.stages.iter().rev().find(|s| s.state.started) else {
                return;
            };
            let current = (stage.kind, stage.state.progress);
            if last != Some(current) {
                println!("  {:?}: {}%", stage.kind, stage.state.progress);
                last = Some(current);
            }
        })
        .await?;

    report(&job)
}

fn report(job: &FlashJob) -> Result<()> {
    if let Some(stage) = job.failed_stage() {
        bail!(
            "{:?} failed: {}",
            stage.kind,
            stage.state.error.as_deref().unwrap_or("unknown error")
        );
    }
    if job.cancelled {
        println!("Cancelled");
    } else if job.is_completed() {
        println!("Done");
    } else {
        println!("Job is no longer tracked");
    }
    Ok(())
}

fn print_json(value: Value) {
    match serde_json::to_string_pretty(&value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}
