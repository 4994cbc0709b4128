//! In-process stand-ins for the media engine and the recorder, plus a
//! scripted client for driving a [`SfuServer`] end to end.

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Result, SfuError};
use crate::media::{
    MediaConsumer, MediaEngine, MediaKind, MediaProducer, MediaTransport, PlainTransportSettings,
    SocketTuple, TransportDirection,
};
use crate::recording::{PipelineDescription, RecorderLauncher, RecorderProcess};
use crate::rpc::{frames, Responder, RpcChannel, RpcHandler};
use crate::sfu::SfuServer;

const FAKE_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Router capabilities of the fake engine: Opus and VP8.
pub fn router_capabilities() -> Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "parameters": {},
                "rtcpFeedback": []
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000,
                "parameters": {},
                "rtcpFeedback": [{ "type": "nack" }]
            }
        ],
        "headerExtensions": []
    })
}

#[derive(Default)]
struct FakeState {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
    incompatible: Mutex<HashSet<String>>,
    fail_transports: AtomicBool,
    next_port: AtomicU16,
}

/// Media engine that keeps every object it creates for inspection.
pub struct FakeEngine {
    state: Arc<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let state = FakeState {
            next_port: AtomicU16::new(40000),
            ..FakeState::default()
        };
        Arc::new(Self {
            state: Arc::new(state),
        })
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.state.transports.lock().clone()
    }

    pub fn transport(&self, id: &str) -> Option<Arc<FakeTransport>> {
        self.transports().into_iter().find(|t| t.id == id)
    }

    pub fn webrtc_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports()
            .into_iter()
            .filter(|t| t.direction().is_some())
            .collect()
    }

    pub fn plain_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports()
            .into_iter()
            .filter(|t| t.direction().is_none())
            .collect()
    }

    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.state.producers.lock().clone()
    }

    /// RTP parameters of the first producer of `kind`.
    pub fn produced_with(&self, kind: MediaKind) -> Option<Value> {
        self.producers()
            .into_iter()
            .find(|p| p.kind == kind)
            .map(|p| p.rtp_parameters.clone())
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.state.consumers.lock().clone()
    }

    pub fn consumer(&self, id: &str) -> Option<Arc<FakeConsumer>> {
        self.consumers().into_iter().find(|c| c.id == id)
    }

    /// Makes `can_consume` refuse this producer.
    pub fn mark_incompatible(&self, producer_id: &str) {
        self.state.incompatible.lock().insert(producer_id.to_string());
    }

    /// Makes every transport creation fail.
    pub fn fail_transports(&self, fail: bool) {
        self.state.fail_transports.store(fail, Ordering::SeqCst);
    }

    fn new_transport(&self, kind: FakeTransportKind) -> Result<Arc<dyn MediaTransport>> {
        if self.state.fail_transports.load(Ordering::SeqCst) {
            return Err(SfuError::media_engine("transport creation failed"));
        }
        let port = self.state.next_port.fetch_add(2, Ordering::SeqCst);
        let transport = Arc::new(FakeTransport {
            id: Uuid::new_v4().to_string(),
            kind,
            port,
            connected: Mutex::new(None),
            close_count: AtomicUsize::new(0),
            state: self.state.clone(),
        });
        self.state.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn rtp_capabilities(&self) -> Value {
        router_capabilities()
    }

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>> {
        self.new_transport(FakeTransportKind::WebRtc(direction))
    }

    async fn create_plain_transport(
        &self,
        settings: PlainTransportSettings,
    ) -> Result<Arc<dyn MediaTransport>> {
        self.new_transport(FakeTransportKind::Plain(settings))
    }

    fn can_consume(&self, producer_id: &str, _rtp_capabilities: &Value) -> bool {
        !self.state.incompatible.lock().contains(producer_id)
    }
}

#[derive(Debug, Clone, Copy)]
enum FakeTransportKind {
    WebRtc(TransportDirection),
    Plain(PlainTransportSettings),
}

pub struct FakeTransport {
    id: String,
    kind: FakeTransportKind,
    port: u16,
    connected: Mutex<Option<Value>>,
    close_count: AtomicUsize,
    state: Arc<FakeState>,
}

impl FakeTransport {
    /// `None` for plain transports.
    pub fn direction(&self) -> Option<TransportDirection> {
        match self.kind {
            FakeTransportKind::WebRtc(direction) => Some(direction),
            FakeTransportKind::Plain(_) => None,
        }
    }

    pub fn comedia(&self) -> bool {
        matches!(self.kind, FakeTransportKind::Plain(settings) if settings.comedia)
    }

    /// Parameters of the last `connect` call.
    pub fn connected_with(&self) -> Option<Value> {
        self.connected.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn connection_params(&self) -> Value {
        json!({
            "id": self.id,
            "iceParameters": { "usernameFragment": "fake", "password": "fake", "iceLite": true },
            "iceCandidates": [{ "ip": FAKE_IP.to_string(), "port": self.port, "protocol": "udp" }],
            "dtlsParameters": { "role": "auto", "fingerprints": [] }
        })
    }

    fn local_tuple(&self) -> Option<SocketTuple> {
        match self.kind {
            FakeTransportKind::Plain(settings) => Some(SocketTuple {
                ip: settings.listen_ip,
                port: self.port,
            }),
            FakeTransportKind::WebRtc(_) => None,
        }
    }

    fn local_rtcp_tuple(&self) -> Option<SocketTuple> {
        self.local_tuple().map(|tuple| SocketTuple {
            port: tuple.port + 1,
            ..tuple
        })
    }

    async fn connect(&self, params: Value) -> Result<()> {
        *self.connected.lock() = Some(params);
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> Result<Arc<dyn MediaProducer>> {
        let producer = Arc::new(FakeProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            rtp_parameters,
            close_count: AtomicUsize::new(0),
        });
        self.state.producers.lock().push(producer.clone());
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>> {
        let kind = self
            .state
            .producers
            .lock()
            .iter()
            .find(|p| p.id == producer_id)
            .map(|p| p.kind)
            .ok_or_else(|| SfuError::media_engine(format!("unknown producer {producer_id}")))?;

        let consumer = Arc::new(FakeConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind,
            created_paused: paused,
            paused: AtomicBool::new(paused),
            resume_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            ssrc: rand::random(),
        });
        self.state.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    close_count: AtomicUsize,
}

impl FakeProducer {
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProducer for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    created_paused: bool,
    paused: AtomicBool,
    resume_count: AtomicUsize,
    close_count: AtomicUsize,
    ssrc: u32,
}

impl FakeConsumer {
    pub fn created_paused(&self) -> bool {
        self.created_paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resume_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConsumer for FakeConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        let codec = match self.kind {
            MediaKind::Audio => json!({
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2
            }),
            MediaKind::Video => json!({
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000
            }),
        };
        json!({
            "codecs": [codec],
            "encodings": [{ "ssrc": self.ssrc }],
            "rtcp": { "cname": "fakecname" }
        })
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Recorder launcher that only records what it was asked to run.
#[derive(Default)]
pub struct FakeLauncher {
    launched: Mutex<Vec<PipelineDescription>>,
    stops: Arc<AtomicUsize>,
    fail: AtomicBool,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launched(&self) -> Vec<PipelineDescription> {
        self.launched.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().len()
    }

    /// How many launched processes have been stopped.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecorderLauncher for FakeLauncher {
    async fn launch(&self, pipeline: &PipelineDescription) -> Result<Box<dyn RecorderProcess>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SfuError::recorder("launch refused"));
        }
        self.launched.lock().push(pipeline.clone());
        Ok(Box::new(FakeProcess {
            pid: Some(self.next_pid.fetch_add(1, Ordering::SeqCst) + 1000),
            stops: self.stops.clone(),
        }))
    }
}

struct FakeProcess {
    pid: Option<u32>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl RecorderProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn stop(&mut self) {
        if self.pid.take().is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Client-side handler that queues notifications for the test to read.
struct NotificationSink {
    tx: mpsc::UnboundedSender<(String, Value)>,
}

#[async_trait]
impl RpcHandler for NotificationSink {
    async fn on_request(&self, method: String, _data: Value, responder: Responder) {
        responder.reject(format!("client does not handle {method}"));
    }

    async fn on_notification(&self, method: String, data: Value) {
        let _ = self.tx.send((method, data));
    }

    async fn on_close(&self) {}
}

/// A client connected to a [`SfuServer`] through an in-memory channel pair.
pub struct TestClient {
    channel: RpcChannel,
    peer_id: String,
    notifications: mpsc::UnboundedReceiver<(String, Value)>,
    hangup: Option<oneshot::Sender<()>>,
    server_task: JoinHandle<()>,
}

impl TestClient {
    pub fn connect(server: &Arc<SfuServer>) -> Self {
        let (client, client_out) = RpcChannel::new();
        let (server_channel, server_out) = RpcChannel::new();

        let handler = server.connect(server_channel.clone());
        let peer_id = handler.peer().id().to_string();

        let (hangup, hangup_rx) = oneshot::channel();
        let server_task = tokio::spawn(async move {
            let incoming = frames(client_out).take_until(hangup_rx);
            server_channel.run(incoming, handler).await;
        });

        let (tx, notifications) = mpsc::unbounded_channel();
        {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .run(frames(server_out), Arc::new(NotificationSink { tx }))
                    .await;
            });
        }

        Self {
            channel: client,
            peer_id,
            notifications,
            hangup: Some(hangup),
            server_task,
        }
    }

    /// The id the server assigned to this client's peer.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn request(&self, method: &str, data: Value) -> Result<Value> {
        self.channel.request(method, data).await
    }

    pub fn notify(&self, method: &str, data: Value) {
        self.channel.notify(method, data);
    }

    pub async fn join(&self, display_name: &str) -> Result<Value> {
        self.request(
            "join",
            json!({ "rtpCapabilities": router_capabilities(), "displayName": display_name }),
        )
        .await
    }

    /// Creates a producer transport and produces one video and one audio
    /// track. Returns the producer ids.
    pub async fn produce_media(&self) -> Result<Vec<String>> {
        let transport = self.request("createProducerTransport", json!({})).await?;
        let transport_id = transport["id"].as_str().unwrap_or_default().to_string();
        self.request(
            "connectProducerTransport",
            json!({ "dtlsParameters": { "role": "client", "fingerprints": [] } }),
        )
        .await?;

        let mut ids = Vec::new();
        for kind in ["video", "audio"] {
            let produced = self
                .request(
                    "produce",
                    json!({ "transportId": transport_id, "kind": kind, "rtpParameters": {} }),
                )
                .await?;
            ids.push(produced["id"].as_str().unwrap_or_default().to_string());
        }
        Ok(ids)
    }

    /// Waits for the next notification. Panics after five seconds.
    pub async fn next_notification(&mut self) -> (String, Value) {
        match tokio::time::timeout(Duration::from_secs(5), self.notifications.recv()).await {
            Ok(Some(notification)) => notification,
            Ok(None) => panic!("connection closed while waiting for a notification"),
            Err(_) => panic!("no notification within 5s"),
        }
    }

    /// Skips notifications until one named `method` arrives.
    pub async fn next_named(&mut self, method: &str) -> Value {
        loop {
            let (name, data) = self.next_notification().await;
            if name == method {
                return data;
            }
        }
    }

    pub fn try_notification(&mut self) -> Option<(String, Value)> {
        self.notifications.try_recv().ok()
    }

    /// Closes the connection and waits for the server to finish cleaning up.
    pub async fn hang_up(mut self) {
        if let Some(hangup) = self.hangup.take() {
            let _ = hangup.send(());
        }
        let _ = (&mut self.server_task).await;
    }
}

/// Polls `check` until it holds. Panics after roughly two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
