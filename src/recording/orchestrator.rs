use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::pipeline::{recording_pipeline, RtpEndpoint};
use super::port::{PortAllocator, PortLease};
use super::process::{RecorderLauncher, RecorderProcess};
use super::state::RecordingState;
use crate::config::RecordingConfig;
use crate::error::{Result, SfuError};
use crate::media::{
    MediaConsumer, MediaEngine, MediaKind, MediaProducer, MediaTransport, PlainTransportSettings,
};
use crate::sfu::{Peer, SessionRegistry};

/// One producer forwarded to the recorder over a plain transport.
struct OutboundLeg {
    transport: Arc<dyn MediaTransport>,
    consumer: Arc<dyn MediaConsumer>,
    endpoint: RtpEndpoint,
    _rtp_port: PortLease,
    _rtcp_port: PortLease,
}

impl OutboundLeg {
    async fn close(self) {
        if let Err(e) = self.consumer.close().await {
            tracing::warn!(consumer_id = %self.consumer.id(), error = %e, "Failed to close recording consumer");
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(transport_id = %self.transport.id(), error = %e, "Failed to close recording transport");
        }
    }
}

struct ActiveRecording {
    peer_id: String,
    output_path: PathBuf,
    process: Box<dyn RecorderProcess>,
    video: OutboundLeg,
    audio: OutboundLeg,
    warmup: JoinHandle<()>,
}

impl ActiveRecording {
    async fn shutdown(mut self) {
        self.warmup.abort();
        self.process.stop().await;
        self.video.close().await;
        self.audio.close().await;
        tracing::info!(
            peer_id = %self.peer_id,
            file = %self.output_path.display(),
            "Stopped recording"
        );
    }
}

/// Keeps at most one recording running and moves it to another peer when
/// the source leaves.
pub struct RecordingOrchestrator {
    engine: Arc<dyn MediaEngine>,
    launcher: Arc<dyn RecorderLauncher>,
    ports: PortAllocator,
    config: RecordingConfig,
    active: Mutex<Option<ActiveRecording>>,
}

impl RecordingOrchestrator {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn RecorderLauncher>,
        config: RecordingConfig,
    ) -> Self {
        let ports = PortAllocator::new(config.listen_ip);
        Self::with_ports(engine, launcher, ports, config)
    }

    pub fn with_ports(
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn RecorderLauncher>,
        ports: PortAllocator,
        config: RecordingConfig,
    ) -> Self {
        Self {
            engine,
            launcher,
            ports,
            config,
            active: Mutex::new(None),
        }
    }

    /// Starts a recording unless one is already running. `target` is tried
    /// first; when it is absent or no longer registered, any registered
    /// non-injected peer is used. Returns the source peer id when a
    /// recording was started.
    pub async fn check_and_start(
        &self,
        registry: &SessionRegistry,
        target: Option<Arc<Peer>>,
    ) -> Result<Option<String>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let mut active = self.active.lock().await;
        if let Some(recording) = active.as_ref() {
            tracing::debug!(peer_id = %recording.peer_id, "A recorder already exists");
            return Ok(None);
        }

        let target = match target {
            Some(peer) if registry.contains(peer.id()).await => Some(peer),
            _ => registry.first_recordable().await,
        };
        let Some(peer) = target.filter(|peer| !peer.is_injected()) else {
            tracing::info!("No peer available to record");
            return Ok(None);
        };

        let recording = self.start_recording(&peer).await?;
        let peer_id = recording.peer_id.clone();
        *active = Some(recording);
        Ok(Some(peer_id))
    }

    /// Stops the recording if `peer_id` is its source. Returns whether it was.
    pub async fn stop_if_source(&self, peer_id: &str) -> bool {
        let recording = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(recording) if recording.peer_id == peer_id => active.take(),
                _ => None,
            }
        };

        match recording {
            Some(recording) => {
                recording.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop(&self) {
        let recording = self.active.lock().await.take();
        if let Some(recording) = recording {
            recording.shutdown().await;
        }
    }

    pub async fn state(&self) -> RecordingState {
        match self.active.lock().await.as_ref() {
            Some(recording) => RecordingState::Recording {
                peer_id: recording.peer_id.clone(),
                output_path: recording.output_path.clone(),
            },
            None => RecordingState::Idle,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn source_peer(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|recording| recording.peer_id.clone())
    }

    async fn start_recording(&self, peer: &Peer) -> Result<ActiveRecording> {
        let (Some(video_producer), Some(audio_producer)) = peer.recording_sources().await else {
            return Err(SfuError::MissingProducers(peer.id().to_string()));
        };

        let video = self.open_outbound(video_producer.as_ref()).await?;
        let audio = match self.open_outbound(audio_producer.as_ref()).await {
            Ok(leg) => leg,
            Err(e) => {
                video.close().await;
                return Err(e);
            }
        };

        let output_path = match self.output_path(peer).await {
            Ok(path) => path,
            Err(e) => {
                video.close().await;
                audio.close().await;
                return Err(e);
            }
        };

        let pipeline = recording_pipeline(
            &output_path,
            self.config.listen_ip,
            &video.endpoint,
            &audio.endpoint,
        );
        let process = match self.launcher.launch(&pipeline).await {
            Ok(process) => process,
            Err(e) => {
                video.close().await;
                audio.close().await;
                return Err(e);
            }
        };

        let warmup = self.schedule_resume(
            peer.id().to_string(),
            [video.consumer.clone(), audio.consumer.clone()],
        );

        tracing::info!(
            peer_id = %peer.id(),
            file = %output_path.display(),
            "Started recording"
        );

        Ok(ActiveRecording {
            peer_id: peer.id().to_string(),
            output_path,
            process,
            video,
            audio,
            warmup,
        })
    }

    /// The recorder is not observed for readiness; its consumers are simply
    /// resumed once the warm-up delay has passed.
    fn schedule_resume(
        &self,
        peer_id: String,
        consumers: [Arc<dyn MediaConsumer>; 2],
    ) -> JoinHandle<()> {
        let warmup = self.config.warmup;
        tokio::spawn(async move {
            tokio::time::sleep(warmup).await;
            for consumer in consumers {
                if let Err(e) = consumer.resume().await {
                    tracing::error!(
                        peer_id = %peer_id,
                        consumer_id = %consumer.id(),
                        error = %e,
                        "Failed to resume recording consumer"
                    );
                }
            }
            tracing::info!(peer_id = %peer_id, "Recording consumers resumed");
        })
    }

    async fn open_outbound(&self, producer: &dyn MediaProducer) -> Result<OutboundLeg> {
        let transport = self
            .engine
            .create_plain_transport(PlainTransportSettings {
                listen_ip: self.config.listen_ip,
                comedia: false,
            })
            .await?;

        match self.connect_outbound(transport.clone(), producer).await {
            Ok(leg) => Ok(leg),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::warn!(transport_id = %transport.id(), error = %close_err, "Failed to close recording transport");
                }
                Err(e)
            }
        }
    }

    async fn connect_outbound(
        &self,
        transport: Arc<dyn MediaTransport>,
        producer: &dyn MediaProducer,
    ) -> Result<OutboundLeg> {
        let rtp_port = self.ports.allocate().await?;
        let rtcp_port = self.ports.allocate().await?;

        transport
            .connect(json!({
                "ip": self.config.listen_ip.to_string(),
                "port": rtp_port.port(),
                "rtcpPort": rtcp_port.port(),
            }))
            .await?;

        let capabilities = self.plain_consumer_capabilities(producer.kind())?;
        let consumer = transport.consume(&producer.id(), capabilities, true).await?;

        let endpoint = RtpEndpoint::from_rtp_parameters(
            rtp_port.port(),
            rtcp_port.port(),
            transport.local_rtcp_tuple().map(|tuple| tuple.port),
            &consumer.rtp_parameters(),
        );
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if let Err(close_err) = consumer.close().await {
                    tracing::warn!(consumer_id = %consumer.id(), error = %close_err, "Failed to close recording consumer");
                }
                return Err(e);
            }
        };

        Ok(OutboundLeg {
            transport,
            consumer,
            endpoint,
            _rtp_port: rtp_port,
            _rtcp_port: rtcp_port,
        })
    }

    /// The router's first codec of `kind`, without header extensions.
    fn plain_consumer_capabilities(&self, kind: MediaKind) -> Result<Value> {
        let capabilities = self.engine.rtp_capabilities();
        let kind_name = kind.to_string();
        let codec = capabilities["codecs"]
            .as_array()
            .and_then(|codecs| {
                codecs
                    .iter()
                    .find(|codec| codec["kind"].as_str() == Some(kind_name.as_str()))
            })
            .cloned()
            .ok_or_else(|| SfuError::media_engine(format!("router has no {kind} codec")))?;

        Ok(json!({ "codecs": [codec], "headerExtensions": [] }))
    }

    async fn output_path(&self, peer: &Peer) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let name = file_stem(&peer.display_name().await, peer.id());
        Ok(recording_file(&self.config.output_dir, &name, timestamp))
    }
}

fn file_stem(display_name: &str, peer_id: &str) -> String {
    let stem: String = display_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        peer_id.to_string()
    } else {
        stem
    }
}

fn recording_file(dir: &Path, stem: &str, timestamp: u128) -> PathBuf {
    dir.join(format!("{}_{}.webm", stem, timestamp))
}
