//! Production media engine: one mediasoup worker, one router, one WebRTC
//! server shared by every WebRTC transport.

use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::Arc;

use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerSettings};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{
    MediaConsumer, MediaEngine, MediaKind as Kind, MediaProducer, MediaTransport,
    PlainTransportSettings, SocketTuple, TransportDirection,
};
use crate::config::MediaConfig;
use crate::error::{Result, SfuError};

fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(48000).unwrap_or(NonZeroU32::MIN),
            channels: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap_or(NonZeroU32::MIN),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
    ]
}

fn log_level(level: &str) -> WorkerLogLevel {
    match level {
        "debug" => WorkerLogLevel::Debug,
        "error" => WorkerLogLevel::Error,
        "none" => WorkerLogLevel::None,
        _ => WorkerLogLevel::Warn,
    }
}

fn engine_error(e: impl std::fmt::Display) -> SfuError {
    SfuError::media_engine(e.to_string())
}

fn from_json<T: DeserializeOwned>(what: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| SfuError::InvalidSignalingMessage(format!("{}: {}", what, e)))
}

fn listen_info(ip: IpAddr, announced: Option<IpAddr>, port: Option<u16>) -> ListenInfo {
    ListenInfo {
        protocol: Protocol::Udp,
        ip,
        announced_address: announced.map(|ip| ip.to_string()),
        expose_internal_ip: false,
        port,
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    }
}

pub struct MediasoupEngine {
    _worker_manager: WorkerManager,
    _worker: Worker,
    router: Router,
    webrtc_server: WebRtcServer,
    listen_ip: IpAddr,
}

impl MediasoupEngine {
    pub async fn start(config: &MediaConfig) -> Result<Self> {
        let worker_manager = WorkerManager::new();

        let mut settings = WorkerSettings::default();
        settings.log_level = log_level(&config.log_level);

        let worker = worker_manager
            .create_worker(settings)
            .await
            .map_err(|e| engine_error(format!("failed to create worker: {e}")))?;

        worker
            .on_dead(|reason| {
                tracing::error!(reason = ?reason, "mediasoup worker died, exiting");
                std::process::exit(1);
            })
            .detach();

        let webrtc_server = worker
            .create_webrtc_server(WebRtcServerOptions::new(WebRtcServerListenInfos::new(
                listen_info(config.listen_ip, Some(config.announced_ip), Some(config.port)),
            )))
            .await
            .map_err(|e| engine_error(format!("failed to create WebRTC server: {e}")))?;

        let router = worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| engine_error(format!("failed to create router: {e}")))?;

        tracing::info!(
            listen_ip = %config.listen_ip,
            announced_ip = %config.announced_ip,
            port = config.port,
            "Media engine started"
        );

        Ok(Self {
            _worker_manager: worker_manager,
            _worker: worker,
            router,
            webrtc_server,
            listen_ip: config.listen_ip,
        })
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    fn rtp_capabilities(&self) -> Value {
        serde_json::to_value(self.router.rtp_capabilities()).unwrap_or(Value::Null)
    }

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>> {
        let options = WebRtcTransportOptions::new_with_server(self.webrtc_server.clone());
        let transport = self
            .router
            .create_webrtc_transport(options)
            .await
            .map_err(engine_error)?;

        tracing::debug!(transport_id = %transport.id(), direction = ?direction, "Created WebRTC transport");
        Ok(Arc::new(SoupTransport::new(
            TransportHandle::WebRtc(transport),
            self.listen_ip,
        )))
    }

    async fn create_plain_transport(
        &self,
        settings: PlainTransportSettings,
    ) -> Result<Arc<dyn MediaTransport>> {
        let mut options = PlainTransportOptions::new(listen_info(settings.listen_ip, None, None));
        options.rtcp_mux = false;
        options.comedia = settings.comedia;

        let transport = self
            .router
            .create_plain_transport(options)
            .await
            .map_err(engine_error)?;

        Ok(Arc::new(SoupTransport::new(
            TransportHandle::Plain(transport),
            settings.listen_ip,
        )))
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(producer_id) = serde_json::from_value::<ProducerId>(json!(producer_id)) else {
            return false;
        };
        let Ok(capabilities) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return false;
        };
        self.router.can_consume(&producer_id, &capabilities)
    }
}

#[derive(Clone)]
enum TransportHandle {
    WebRtc(WebRtcTransport),
    Plain(PlainTransport),
}

/// mediasoup objects close when their last handle drops, so closing means
/// taking the handle out.
struct SoupTransport {
    id: String,
    listen_ip: IpAddr,
    inner: Mutex<Option<TransportHandle>>,
}

impl SoupTransport {
    fn new(handle: TransportHandle, listen_ip: IpAddr) -> Self {
        let id = match &handle {
            TransportHandle::WebRtc(t) => t.id().to_string(),
            TransportHandle::Plain(t) => t.id().to_string(),
        };
        Self {
            id,
            listen_ip,
            inner: Mutex::new(Some(handle)),
        }
    }

    fn handle(&self) -> Result<TransportHandle> {
        self.inner
            .lock()
            .clone()
            .ok_or_else(|| SfuError::media_engine(format!("transport {} is closed", self.id)))
    }
}

#[async_trait]
impl MediaTransport for SoupTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn connection_params(&self) -> Value {
        match self.inner.lock().as_ref() {
            Some(TransportHandle::WebRtc(t)) => json!({
                "id": self.id,
                "iceParameters": t.ice_parameters(),
                "iceCandidates": t.ice_candidates(),
                "dtlsParameters": t.dtls_parameters(),
            }),
            _ => json!({ "id": self.id }),
        }
    }

    fn local_tuple(&self) -> Option<SocketTuple> {
        match self.inner.lock().as_ref() {
            Some(TransportHandle::Plain(t)) => Some(SocketTuple {
                ip: self.listen_ip,
                port: t.tuple().local_port(),
            }),
            _ => None,
        }
    }

    fn local_rtcp_tuple(&self) -> Option<SocketTuple> {
        match self.inner.lock().as_ref() {
            Some(TransportHandle::Plain(t)) => t.rtcp_tuple().map(|tuple| SocketTuple {
                ip: self.listen_ip,
                port: tuple.local_port(),
            }),
            _ => None,
        }
    }

    async fn connect(&self, params: Value) -> Result<()> {
        match self.handle()? {
            TransportHandle::WebRtc(t) => {
                let dtls_parameters: DtlsParameters =
                    from_json("dtlsParameters", params["dtlsParameters"].clone())?;
                t.connect(WebRtcTransportRemoteParameters { dtls_parameters })
                    .await
                    .map_err(engine_error)
            }
            TransportHandle::Plain(t) => {
                let ip: IpAddr = from_json("ip", params["ip"].clone())?;
                let port: u16 = from_json("port", params["port"].clone())?;
                let rtcp_port: Option<u16> = from_json("rtcpPort", params["rtcpPort"].clone())?;
                t.connect(PlainTransportRemoteParameters {
                    ip: Some(ip),
                    port: Some(port),
                    rtcp_port,
                    srtp_parameters: None,
                })
                .await
                .map_err(engine_error)
            }
        }
    }

    async fn produce(&self, kind: Kind, rtp_parameters: Value) -> Result<Arc<dyn MediaProducer>> {
        let rtp_parameters: RtpParameters = from_json("rtpParameters", rtp_parameters)?;
        let options = ProducerOptions::new(to_soup_kind(kind), rtp_parameters);
        let producer = match self.handle()? {
            TransportHandle::WebRtc(t) => t.produce(options).await,
            TransportHandle::Plain(t) => t.produce(options).await,
        }
        .map_err(engine_error)?;

        Ok(Arc::new(SoupProducer {
            id: producer.id().to_string(),
            kind,
            inner: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>> {
        let producer_id: ProducerId = from_json("producerId", json!(producer_id))?;
        let rtp_capabilities: RtpCapabilities = from_json("rtpCapabilities", rtp_capabilities)?;
        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = paused;

        let consumer = match self.handle()? {
            TransportHandle::WebRtc(t) => t.consume(options).await,
            TransportHandle::Plain(t) => t.consume(options).await,
        }
        .map_err(engine_error)?;

        Ok(Arc::new(SoupConsumer {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: from_soup_kind(consumer.kind()),
            rtp_parameters: serde_json::to_value(consumer.rtp_parameters())?,
            inner: Mutex::new(Some(consumer)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().take();
        Ok(())
    }
}

fn to_soup_kind(kind: Kind) -> MediaKind {
    match kind {
        Kind::Audio => MediaKind::Audio,
        Kind::Video => MediaKind::Video,
    }
}

fn from_soup_kind(kind: MediaKind) -> Kind {
    match kind {
        MediaKind::Audio => Kind::Audio,
        MediaKind::Video => Kind::Video,
    }
}

struct SoupProducer {
    id: String,
    kind: Kind,
    inner: Mutex<Option<Producer>>,
}

#[async_trait]
impl MediaProducer for SoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> Kind {
        self.kind
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().take();
        Ok(())
    }
}

struct SoupConsumer {
    id: String,
    producer_id: String,
    kind: Kind,
    rtp_parameters: Value,
    inner: Mutex<Option<Consumer>>,
}

#[async_trait]
impl MediaConsumer for SoupConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> Kind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> Result<()> {
        let consumer = self
            .inner
            .lock()
            .clone()
            .ok_or_else(|| SfuError::ConsumerNotFound(self.id.clone()))?;
        consumer.resume().await.map_err(engine_error)
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().take();
        Ok(())
    }
}
