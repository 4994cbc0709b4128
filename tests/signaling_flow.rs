// End-to-end signaling flows against an in-process server with a fake media
// engine and recorder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use groupcall_sfu::config::RecordingConfig;
use groupcall_sfu::sfu::SfuServer;
use groupcall_sfu::testing::{eventually, FakeEngine, FakeLauncher, TestClient};
use serde_json::json;

struct Harness {
    server: Arc<SfuServer>,
    engine: Arc<FakeEngine>,
    launcher: Arc<FakeLauncher>,
    output_dir: PathBuf,
}

impl Harness {
    fn new(recording: bool) -> Self {
        let engine = FakeEngine::new();
        let launcher = FakeLauncher::new();
        let output_dir = std::env::temp_dir().join(format!("groupcall-test-{}", uuid::Uuid::new_v4()));
        let config = RecordingConfig {
            enabled: recording,
            output_dir: output_dir.clone(),
            ..RecordingConfig::default()
        };
        let server = SfuServer::new(engine.clone(), launcher.clone(), config);
        Self {
            server,
            engine,
            launcher,
            output_dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.output_dir);
    }
}

#[tokio::test]
async fn test_join_broadcasts_presence() {
    let harness = Harness::new(false);
    let mut ada = TestClient::connect(&harness.server);
    let mut bob = TestClient::connect(&harness.server);

    ada.join("ada").await.unwrap();
    let roster = ada.next_named("setAvailablePeers").await;
    assert_eq!(roster, json!({ "otherPeerDetails": [] }));

    bob.join("bob").await.unwrap();

    let joined = ada.next_named("peerJoined").await;
    assert_eq!(joined, json!({ "id": bob.peer_id(), "displayName": "bob" }));

    let roster = bob.next_named("setAvailablePeers").await;
    assert_eq!(
        roster,
        json!({ "otherPeerDetails": [{ "id": ada.peer_id(), "displayName": "ada" }] })
    );
    assert_eq!(harness.server.registry().len().await, 2);
}

#[tokio::test]
async fn test_joining_twice_keeps_one_entry() {
    let harness = Harness::new(false);
    let client = TestClient::connect(&harness.server);

    client.join("ada").await.unwrap();
    client.join("ada again").await.unwrap();

    assert_eq!(harness.server.registry().len().await, 1);
    let peer = harness.server.registry().get(client.peer_id()).await.unwrap();
    assert_eq!(peer.display_name().await, "ada again");
}

#[tokio::test]
async fn test_get_router_capabilities() {
    let harness = Harness::new(false);
    let client = TestClient::connect(&harness.server);

    let capabilities = client
        .request("getRouterRtpCapabilities", json!({}))
        .await
        .unwrap();

    assert_eq!(capabilities["codecs"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_second_producer_transport_is_rejected() {
    let harness = Harness::new(false);
    let client = TestClient::connect(&harness.server);

    let transport = client
        .request("createProducerTransport", json!({}))
        .await
        .unwrap();
    assert!(transport["iceParameters"].is_object());
    assert!(transport["dtlsParameters"].is_object());

    let err = client
        .request("createProducerTransport", json!({}))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "There can only be one producer transport for this peer"
    );

    let err = client
        .request("createConsumerTransport", json!({}))
        .await
        .and(client.request("createConsumerTransport", json!({})).await)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "There can only be one consumer transport for this peer"
    );
    assert_eq!(harness.engine.webrtc_transports().len(), 2);
}

#[tokio::test]
async fn test_produce_on_wrong_transport_id() {
    let harness = Harness::new(false);
    let client = TestClient::connect(&harness.server);

    let err = client
        .request(
            "produce",
            json!({ "transportId": "nope", "kind": "video", "rtpParameters": {} }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no producer transport");

    client
        .request("createProducerTransport", json!({}))
        .await
        .unwrap();
    let err = client
        .request(
            "produce",
            json!({ "transportId": "nope", "kind": "video", "rtpParameters": {} }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid transport id");

    let peer = harness.server.registry().get(client.peer_id()).await;
    assert!(peer.is_none());
    assert!(harness.engine.producers().is_empty());
}

#[tokio::test]
async fn test_connect_forwards_dtls_parameters() {
    let harness = Harness::new(false);
    let client = TestClient::connect(&harness.server);

    let transport = client
        .request("createConsumerTransport", json!({}))
        .await
        .unwrap();
    let reply = client
        .request(
            "connectConsumerTransport",
            json!({ "dtlsParameters": { "role": "client", "fingerprints": [] } }),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({}));

    let fake = harness
        .engine
        .transport(transport["id"].as_str().unwrap())
        .unwrap();
    assert_eq!(
        fake.connected_with(),
        Some(json!({ "dtlsParameters": { "role": "client", "fingerprints": [] } }))
    );
}

#[tokio::test]
async fn test_consume_starts_video_paused() {
    let harness = Harness::new(false);
    let ada = TestClient::connect(&harness.server);
    let bob = TestClient::connect(&harness.server);

    let producer_ids = ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();
    bob.join("bob").await.unwrap();

    bob.request("createConsumerTransport", json!({}))
        .await
        .unwrap();
    let reply = bob
        .request("consume", json!({ "peerId": ada.peer_id() }))
        .await
        .unwrap();

    let details = reply["consumerDetailsArray"].as_array().unwrap();
    assert_eq!(details.len(), 2);

    for detail in details {
        let producer_id = detail["producerId"].as_str().unwrap();
        assert!(producer_ids.iter().any(|id| id == producer_id));
        assert!(detail["rtpParameters"].is_object());

        let consumer = harness
            .engine
            .consumer(detail["id"].as_str().unwrap())
            .unwrap();
        match detail["kind"].as_str().unwrap() {
            "video" => assert!(consumer.created_paused()),
            "audio" => assert!(!consumer.created_paused()),
            other => panic!("unexpected kind {other}"),
        }
    }
}

#[tokio::test]
async fn test_consume_preconditions() {
    let harness = Harness::new(false);
    let ada = TestClient::connect(&harness.server);
    let bob = TestClient::connect(&harness.server);

    ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();

    let err = bob
        .request("consume", json!({ "peerId": "ghost" }))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid peer");

    let err = bob
        .request("consume", json!({ "peerId": ada.peer_id() }))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no consumer transport");

    bob.request("createConsumerTransport", json!({}))
        .await
        .unwrap();
    let err = bob
        .request("consume", json!({ "peerId": ada.peer_id() }))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "peer has not joined");
    assert!(harness.engine.consumers().is_empty());
}

#[tokio::test]
async fn test_incompatible_producer_creates_no_consumers() {
    let harness = Harness::new(false);
    let ada = TestClient::connect(&harness.server);
    let bob = TestClient::connect(&harness.server);

    let producer_ids = ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();
    bob.join("bob").await.unwrap();
    bob.request("createConsumerTransport", json!({}))
        .await
        .unwrap();

    harness.engine.mark_incompatible(&producer_ids[1]);

    let err = bob
        .request("consume", json!({ "peerId": ada.peer_id() }))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "can not consume from producer");
    assert!(harness.engine.consumers().is_empty());
}

#[tokio::test]
async fn test_resume_consumer_notification() {
    let harness = Harness::new(false);
    let ada = TestClient::connect(&harness.server);
    let bob = TestClient::connect(&harness.server);

    ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();
    bob.join("bob").await.unwrap();
    bob.request("createConsumerTransport", json!({}))
        .await
        .unwrap();
    let reply = bob
        .request("consume", json!({ "peerId": ada.peer_id() }))
        .await
        .unwrap();

    let video_id = reply["consumerDetailsArray"]
        .as_array()
        .unwrap()
        .iter()
        .find(|detail| detail["kind"] == "video")
        .and_then(|detail| detail["id"].as_str())
        .unwrap()
        .to_string();

    bob.notify("resumeConsumer", json!({ "consumerId": video_id }));

    let consumer = harness.engine.consumer(&video_id).unwrap();
    eventually(|| {
        let consumer = consumer.clone();
        async move { !consumer.is_paused() }
    })
    .await;
    assert_eq!(consumer.resume_count(), 1);
}

#[tokio::test]
async fn test_unknown_method_keeps_connection_open() {
    let harness = Harness::new(false);
    let client = TestClient::connect(&harness.server);

    let err = client.request("fly", json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "unknown method: fly");

    client.join("ada").await.unwrap();
    assert!(harness.server.registry().contains(client.peer_id()).await);
}

#[tokio::test]
async fn test_engine_failure_is_reported_generically() {
    let harness = Harness::new(false);
    let client = TestClient::connect(&harness.server);
    harness.engine.fail_transports(true);

    let err = client
        .request("createProducerTransport", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "request failed");

    harness.engine.fail_transports(false);
    client
        .request("createProducerTransport", json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_disconnect_notifies_and_releases_media() {
    let harness = Harness::new(false);
    let ada = TestClient::connect(&harness.server);
    let mut bob = TestClient::connect(&harness.server);

    ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();
    bob.join("bob").await.unwrap();
    bob.request("createConsumerTransport", json!({}))
        .await
        .unwrap();
    bob.request("consume", json!({ "peerId": ada.peer_id() }))
        .await
        .unwrap();

    let ada_id = ada.peer_id().to_string();
    ada.hang_up().await;

    let left = bob.next_named("peerLeft").await;
    assert_eq!(left, json!({ "id": ada_id }));

    assert!(!harness.server.registry().contains(&ada_id).await);
    assert!(harness
        .engine
        .producers()
        .iter()
        .all(|producer| producer.close_count() == 1));

    let bob_peer = harness.server.registry().get(bob.peer_id()).await.unwrap();
    assert!(bob_peer.media().await.consumers.is_empty());
}

#[tokio::test]
async fn test_recording_starts_on_joining_producer() {
    let harness = Harness::new(true);
    let ada = TestClient::connect(&harness.server);

    ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();

    let server = harness.server.clone();
    eventually(|| {
        let server = server.clone();
        async move { server.recording().is_active().await }
    })
    .await;

    assert_eq!(
        harness.server.recording().source_peer().await.as_deref(),
        Some(ada.peer_id())
    );
    assert_eq!(harness.launcher.launch_count(), 1);
    assert_eq!(harness.engine.plain_transports().len(), 2);
    assert!(harness
        .engine
        .consumers()
        .iter()
        .all(|consumer| consumer.created_paused()));
}

#[tokio::test]
async fn test_recording_is_deferred_without_producers() {
    let harness = Harness::new(true);
    let ada = TestClient::connect(&harness.server);

    ada.join("ada").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!harness.server.recording().is_active().await);
    assert_eq!(harness.launcher.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recording_consumers_resume_after_warmup() {
    let harness = Harness::new(true);
    let ada = TestClient::connect(&harness.server);

    ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();

    let launcher = harness.launcher.clone();
    eventually(|| {
        let launcher = launcher.clone();
        async move { launcher.launch_count() == 1 }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let consumers = harness.engine.consumers();
    assert_eq!(consumers.len(), 2);
    assert!(consumers.iter().all(|consumer| consumer.created_paused()));
    assert!(consumers.iter().all(|consumer| consumer.resume_count() == 1));
}

#[tokio::test]
async fn test_recording_fails_over_to_remaining_peer() {
    let harness = Harness::new(true);
    let ada = TestClient::connect(&harness.server);
    let bob = TestClient::connect(&harness.server);

    ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();

    let server = harness.server.clone();
    eventually(|| {
        let server = server.clone();
        async move { server.recording().is_active().await }
    })
    .await;

    bob.produce_media().await.unwrap();
    bob.join("bob").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.launcher.launch_count(), 1);

    ada.hang_up().await;

    let server = harness.server.clone();
    let bob_id = bob.peer_id().to_string();
    eventually(|| {
        let server = server.clone();
        let bob_id = bob_id.clone();
        async move { server.recording().source_peer().await.as_deref() == Some(bob_id.as_str()) }
    })
    .await;

    assert_eq!(harness.launcher.launch_count(), 2);
    assert_eq!(harness.launcher.stop_count(), 1);
}

#[tokio::test]
async fn test_disconnect_of_non_source_keeps_recording() {
    let harness = Harness::new(true);
    let ada = TestClient::connect(&harness.server);
    let bob = TestClient::connect(&harness.server);

    ada.produce_media().await.unwrap();
    ada.join("ada").await.unwrap();

    let server = harness.server.clone();
    eventually(|| {
        let server = server.clone();
        async move { server.recording().is_active().await }
    })
    .await;

    bob.join("bob").await.unwrap();
    bob.hang_up().await;

    assert_eq!(
        harness.server.recording().source_peer().await.as_deref(),
        Some(ada.peer_id())
    );
    assert_eq!(harness.launcher.stop_count(), 0);
}
