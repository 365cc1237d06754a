mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{harness, payload, release_archive};
use flashd::core::{FlashJob, StageKind};
use flashd::rpc::{ClientError, JOB_NOT_FOUND, JobCreated, OPERATION_FAILED, RpcClient, RpcServer};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const ARCHIVE: &str = "https://downloads.example.com/edgetx-2.10.zip";

async fn serve(h: &common::Harness) -> (Arc<RpcServer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RpcServer::new(h.orchestrator.clone(), addr));
    tokio::spawn({
        let server = server.clone();
        async move { server.start_with(listener).await }
    });
    (server, addr)
}

#[tokio::test]
async fn status_and_device_listing() {
    let h = harness();
    h.controller.add_device("dfu-1");
    let (server, addr) = serve(&h).await;
    let client = RpcClient::new(addr);

    let status: Value = client.call_no_params("daemon.status").await.unwrap();
    assert_eq!(status["runningJobs"], 0);
    assert_eq!(status["simulation"], true);

    let devices: Value = client.call_no_params("devices.list").await.unwrap();
    assert_eq!(devices[0]["id"], "dfu-1");
    assert_eq!(devices[0]["vendorId"], 0x0483);

    server.shutdown();
}

#[tokio::test]
async fn flash_job_streams_updates_until_done() {
    let h = harness();
    h.source
        .insert(ARCHIVE, release_archive(&payload(8192, 1), &[]));
    h.controller.add_device("dfu-1");
    let (_server, addr) = serve(&h).await;
    let client = RpcClient::new(addr);

    let created: JobCreated = client
        .call(
            "jobs.create",
            Some(json!({
                "deviceId": "dfu-1",
                "firmware": {"source": "release", "archiveUrl": ARCHIVE, "target": "tx16s"}
            })),
        )
        .await
        .unwrap();

    let mut updates = 0;
    let job = client
        .watch_job(&created.id, |_| updates += 1)
        .await
        .unwrap();
    assert!(job.is_completed(), "job failed: {:?}", job.failed_stage());
    assert!(updates >= 1);

    let fetched: FlashJob = client
        .call("jobs.get", Some(json!({ "id": created.id })))
        .await
        .unwrap();
    assert_eq!(fetched, job);
    assert!(fetched.stage(StageKind::Flash).unwrap().completed);

    let listed: Vec<FlashJob> = client.call_no_params("jobs.list").await.unwrap();
    assert_eq!(listed.len(), 1);

    let status: Value = client.call_no_params("daemon.status").await.unwrap();
    assert_eq!(status["trackedJobs"], 1);
    assert_eq!(status["activeJobs"], 0);

    let dismissed: bool = client
        .call("jobs.dismiss", Some(json!({ "id": created.id })))
        .await
        .unwrap();
    assert!(dismissed);
}

#[tokio::test]
async fn targets_are_listed_through_the_daemon_cache() {
    let h = harness();
    h.source.insert(ARCHIVE, release_archive(&payload(64, 2), &[]));
    let (_server, addr) = serve(&h).await;

    let targets: Value = RpcClient::new(addr)
        .call("firmware.targets", Some(json!({ "archiveUrl": ARCHIVE })))
        .await
        .unwrap();
    assert_eq!(targets[0]["code"], "tx16s");
    assert_eq!(targets[1]["name"], "Jumper T-Pro");
}

#[tokio::test]
async fn failures_carry_codes_and_kinds() {
    let h = harness();
    let (_server, addr) = serve(&h).await;
    let client = RpcClient::new(addr);

    match client
        .call::<Value>("jobs.get", Some(json!({ "id": "nope" })))
        .await
    {
        Err(ClientError::Rpc(error)) => assert_eq!(error.code, JOB_NOT_FOUND),
        other => panic!("expected rpc error, got {other:?}"),
    }

    match client
        .call::<Value>("firmware.targets", Some(json!({ "archiveUrl": ARCHIVE })))
        .await
    {
        Err(ClientError::Rpc(error)) => {
            assert_eq!(error.code, OPERATION_FAILED);
            assert_eq!(error.data.unwrap()["kind"], "transport");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }

    match client.call::<Value>("jobs.explode", None).await {
        Err(ClientError::Rpc(error)) => assert_eq!(error.code, -32601),
        other => panic!("expected rpc error, got {other:?}"),
    }

    match client.call::<Value>("jobs.get", Some(json!({}))).await {
        Err(ClientError::Rpc(error)) => assert_eq!(error.code, -32602),
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn subscribing_to_unknown_job_is_an_error() {
    let h = harness();
    let (_server, addr) = serve(&h).await;

    let err = RpcClient::new(addr)
        .watch_job("missing", |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rpc(ref e) if e.code == JOB_NOT_FOUND));
}
