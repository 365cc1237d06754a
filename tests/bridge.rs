use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use flashd::adapters::{SimulatedBackend, SimulatedHost};
use flashd::bridge::{
    BridgeClient, BridgeHost, BridgeMessage, DeviceRequest, HostCapabilities, RemoteHost, channel,
    serve_capabilities,
};
use flashd::core::device::default_filters;
use flashd::error::BridgeError;
use serde_json::{Value, json};
use tokio::time::timeout;

fn echo_host() -> BridgeHost {
    BridgeHost::new()
        .register_fn("echo", |args| async move {
            let delay = args.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            anyhow::Ok(args.get(1).cloned().unwrap_or(Value::Null))
        })
        .register_fn("deny", |_| async {
            Err::<Value, _>(anyhow::anyhow!("user cancelled the prompt"))
        })
}

#[tokio::test]
async fn replies_are_matched_by_id_not_arrival_order() {
    let (worker, host) = channel();
    echo_host().spawn(host);
    let client = BridgeClient::new(worker);

    let (slow, fast) = tokio::join!(
        client.call("echo", vec![json!(80), json!("slow")]),
        client.call("echo", vec![json!(0), json!("fast")]),
    );
    assert_eq!(slow.unwrap(), json!("slow"));
    assert_eq!(fast.unwrap(), json!("fast"));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn host_error_message_reaches_the_caller() {
    let (worker, host) = channel();
    echo_host().spawn(host);
    let client = BridgeClient::new(worker);

    let err = client.call("deny", vec![]).await.unwrap_err();
    match err {
        BridgeError::Host(message) => assert_eq!(message, "user cancelled the prompt"),
        other => panic!("expected host error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_operation_gets_no_reply() {
    let (worker, host) = channel();
    echo_host().spawn(host);
    let client = BridgeClient::new(worker);

    let result = timeout(Duration::from_millis(100), client.call("format", vec![])).await;
    assert!(result.is_err(), "unknown operation must stay unanswered");
    assert_eq!(client.pending_calls(), 0);

    // The host keeps serving other calls.
    assert_eq!(
        client.call("echo", vec![json!(0), json!(1)]).await.unwrap(),
        json!(1)
    );
}

#[tokio::test]
async fn closing_the_channel_fails_outstanding_calls() {
    let (worker, host) = channel();
    let client = Arc::new(BridgeClient::new(worker));

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("echo", vec![]).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.pending_calls(), 1);

    drop(host);
    let err = timeout(Duration::from_secs(1), call)
        .await
        .expect("call did not finish")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, BridgeError::ChannelClosed));
    assert!(client.is_closed());
    assert_eq!(client.pending_calls(), 0);

    let err = client.call("echo", vec![]).await.unwrap_err();
    assert!(matches!(err, BridgeError::ChannelClosed));
}

#[tokio::test]
async fn late_reply_to_abandoned_call_is_dropped() {
    let (worker, mut host) = channel();
    let client = BridgeClient::new(worker);

    let abandoned = timeout(Duration::from_millis(50), client.call("echo", vec![])).await;
    assert!(abandoned.is_err());
    let request: BridgeMessage = serde_json::from_value(host.recv().await.unwrap()).unwrap();
    assert!(request.is_request());

    // Answer the abandoned call late, then a fresh call properly.
    let late = BridgeMessage::success("echo", request.id(), json!("late"));
    assert!(host.post(serde_json::to_value(late).unwrap()));

    let fresh = tokio::spawn(async move {
        let request: BridgeMessage = serde_json::from_value(host.recv().await.unwrap()).unwrap();
        let reply = BridgeMessage::success("echo", request.id(), json!("fresh"));
        host.post(serde_json::to_value(reply).unwrap());
        host
    });

    assert_eq!(client.call("echo", vec![]).await.unwrap(), json!("fresh"));
    let _host = fresh.await.unwrap();
}

#[tokio::test]
async fn reply_with_wrong_type_is_ignored() {
    let (worker, mut host) = channel();
    let client = Arc::new(BridgeClient::new(worker));

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("requestDevice", vec![]).await }
    });
    let request: BridgeMessage = serde_json::from_value(host.recv().await.unwrap()).unwrap();

    let wrong = BridgeMessage::success("requestDirectory", request.id(), json!("wrong"));
    host.post(serde_json::to_value(wrong).unwrap());
    host.post(json!({"garbage": true}));
    let right = BridgeMessage::success("requestDevice", request.id(), json!("right"));
    host.post(serde_json::to_value(right).unwrap());

    assert_eq!(call.await.unwrap().unwrap(), json!("right"));
}

#[tokio::test]
async fn concurrent_calls_get_distinct_ids() {
    let (worker, mut host) = channel();
    let client = Arc::new(BridgeClient::new(worker));

    let calls: Vec<_> = (0..50)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call("echo", vec![json!(i)]).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for _ in 0..50 {
        let request: BridgeMessage = serde_json::from_value(host.recv().await.unwrap()).unwrap();
        assert!(ids.insert(request.id()), "duplicate id {}", request.id());
        let arg = request.args.args.clone().unwrap_or_default().remove(0);
        let reply = BridgeMessage::success("echo", request.id(), arg);
        host.post(serde_json::to_value(reply).unwrap());
    }

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), json!(i));
    }
}

#[tokio::test]
async fn capabilities_round_trip_through_the_bridge() {
    let (backend, controller) = SimulatedBackend::new();
    controller.add_device("dfu-7");
    let privileged = Arc::new(SimulatedHost::new(Arc::new(backend), Some("/media/sd".into())));

    let (worker, host) = channel();
    serve_capabilities(privileged.clone()).spawn(host);
    let remote = RemoteHost::new(worker);

    let granted = remote
        .request_device(DeviceRequest {
            filters: default_filters(),
            device_id: Some("dfu-7".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(granted.id, "dfu-7");

    let err = remote
        .request_device(DeviceRequest {
            filters: default_filters(),
            device_id: Some("dfu-8".to_string()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no device selected");

    let directory = remote.request_directory(None).await.unwrap();
    assert_eq!(directory.path, std::path::PathBuf::from("/media/sd"));
    assert_eq!(privileged.device_requests(), 2);
}
