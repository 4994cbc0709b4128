use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::injected_source::InjectedSource;
use super::peer::Peer;
use super::registry::SessionRegistry;
use super::signaling::{AvailablePeers, PeerJoined, PeerLeft, SignalingHandler};
use crate::config::{InjectionConfig, RecordingConfig};
use crate::error::{Result, SfuError};
use crate::media::MediaEngine;
use crate::recording::{RecorderLauncher, RecordingOrchestrator};
use crate::rpc::RpcChannel;

/// Shared state behind every connection: the media engine, who is online and
/// the recording.
pub struct SfuServer {
    engine: Arc<dyn MediaEngine>,
    launcher: Arc<dyn RecorderLauncher>,
    registry: SessionRegistry,
    recording: RecordingOrchestrator,
    injected: Mutex<Option<InjectedSource>>,
}

impl SfuServer {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn RecorderLauncher>,
        recording: RecordingConfig,
    ) -> Arc<Self> {
        let orchestrator = RecordingOrchestrator::new(engine.clone(), launcher.clone(), recording);
        Self::with_orchestrator(engine, launcher, orchestrator)
    }

    pub fn with_orchestrator(
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn RecorderLauncher>,
        recording: RecordingOrchestrator,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            launcher,
            registry: SessionRegistry::new(),
            recording,
            injected: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &dyn MediaEngine {
        self.engine.as_ref()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn recording(&self) -> &RecordingOrchestrator {
        &self.recording
    }

    /// Creates the unregistered peer for a new connection and the handler
    /// that will drive it.
    pub fn connect(self: &Arc<Self>, channel: RpcChannel) -> Arc<SignalingHandler> {
        let peer = Peer::human(channel);
        tracing::info!(peer_id = %peer.id(), "New peer connected");
        Arc::new(SignalingHandler::new(peer, self.clone()))
    }

    /// Tells everyone else about `peer`, gives `peer` the roster and offers
    /// it the recording.
    pub async fn announce_join(self: &Arc<Self>, peer: &Arc<Peer>, others: Vec<Arc<Peer>>) {
        let joined = PeerJoined {
            id: peer.id().to_string(),
            display_name: peer.display_name().await,
        };

        let mut other_peer_details = Vec::with_capacity(others.len());
        for other in &others {
            other.notify("peerJoined", to_value(&joined));
            other_peer_details.push(other.details().await);
        }

        peer.notify(
            "setAvailablePeers",
            to_value(&AvailablePeers { other_peer_details }),
        );

        self.trigger_recording(Some(peer.clone()));
    }

    /// Runs the recording check in the background. Failures are logged only.
    pub fn trigger_recording(self: &Arc<Self>, target: Option<Arc<Peer>>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            match server.recording.check_and_start(&server.registry, target).await {
                Ok(Some(peer_id)) => {
                    tracing::info!(peer_id = %peer_id, "Recording source selected");
                }
                Ok(None) => {}
                Err(SfuError::MissingProducers(peer_id)) => {
                    tracing::info!(peer_id = %peer_id, "Recording deferred, peer has no video or audio producer");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start recording");
                }
            }
        })
    }

    /// Releases everything `peer` owned and hands the recording over if it
    /// was the source. Every step runs even if an earlier one failed.
    pub async fn handle_disconnect(self: &Arc<Self>, peer: &Arc<Peer>) {
        let was_registered = self.registry.remove(peer.id()).await.is_some();

        let producer_ids: HashSet<String> = peer
            .producers()
            .await
            .iter()
            .map(|producer| producer.id())
            .collect();
        peer.close_media().await;

        if self.recording.stop_if_source(peer.id()).await {
            tracing::info!(peer_id = %peer.id(), "Recording source left, looking for another");
            self.trigger_recording(None);
        }

        let remaining = self.registry.values().await;
        if !producer_ids.is_empty() {
            for other in &remaining {
                let dropped = other.drop_consumers_of(&producer_ids).await;
                if dropped > 0 {
                    tracing::debug!(peer_id = %other.id(), dropped, "Dropped consumers of departed peer");
                }
            }
        }

        if was_registered {
            let left = to_value(&PeerLeft {
                id: peer.id().to_string(),
            });
            for other in &remaining {
                other.notify("peerLeft", left.clone());
            }
        }

        tracing::info!(peer_id = %peer.id(), "Peer closed");
    }

    /// Starts streaming `config.external_media_file` into the session as a
    /// peer of its own. Does nothing when no file is configured.
    pub async fn start_injected_source(&self, listen_ip: IpAddr, config: &InjectionConfig) -> Result<()> {
        let Some(media_file) = &config.external_media_file else {
            return Ok(());
        };

        let mut injected = self.injected.lock().await;
        if injected.is_some() {
            return Err(SfuError::internal("injected source already running"));
        }

        let source = InjectedSource::start(
            self.engine.as_ref(),
            self.launcher.as_ref(),
            listen_ip,
            &config.display_name,
            media_file,
        )
        .await?;
        self.registry.put(source.peer().clone()).await;
        *injected = Some(source);
        Ok(())
    }

    /// Stops the recording and the injected source.
    pub async fn shutdown(&self) {
        self.recording.stop().await;

        let injected = self.injected.lock().await.take();
        if let Some(source) = injected {
            self.registry.remove(source.peer().id()).await;
            source.stop().await;
        }
    }
}

fn to_value<T: serde::Serialize>(payload: &T) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to encode notification payload");
        serde_json::Value::Null
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, FakeLauncher};
    use std::path::PathBuf;

    fn server_with_launcher(launcher: Arc<FakeLauncher>) -> Arc<SfuServer> {
        let config = RecordingConfig {
            enabled: false,
            ..RecordingConfig::default()
        };
        SfuServer::new(FakeEngine::new(), launcher, config)
    }

    #[tokio::test]
    async fn test_connect_creates_unregistered_peer() {
        let server = server_with_launcher(FakeLauncher::new());
        let (channel, _out) = RpcChannel::new();

        let handler = server.connect(channel);

        assert!(!server.registry().contains(handler.peer().id()).await);
    }

    #[tokio::test]
    async fn test_disconnect_of_unjoined_peer_is_silent() {
        let server = server_with_launcher(FakeLauncher::new());
        let (watcher_channel, mut watcher_out) = RpcChannel::new();
        let watcher = Peer::human(watcher_channel);
        server.registry().put(watcher).await;

        let (channel, _out) = RpcChannel::new();
        let handler = server.connect(channel);
        server.handle_disconnect(handler.peer()).await;

        assert!(watcher_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_injected_source_registers_peer_and_launches_pipeline() {
        let launcher = FakeLauncher::new();
        let server = server_with_launcher(launcher.clone());
        let config = InjectionConfig {
            external_media_file: Some(PathBuf::from("media/sample.mp4")),
            display_name: "gstreamer".to_string(),
        };

        server
            .start_injected_source("127.0.0.1".parse().unwrap(), &config)
            .await
            .unwrap();

        let peers = server.registry().values().await;
        assert_eq!(peers.len(), 1);
        assert!(peers[0].is_injected());
        assert_eq!(peers[0].producers().await.len(), 2);
        assert_eq!(launcher.launch_count(), 1);

        server.shutdown().await;
        assert!(server.registry().is_empty().await);
        assert_eq!(launcher.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_no_media_file_means_no_injected_source() {
        let launcher = FakeLauncher::new();
        let server = server_with_launcher(launcher.clone());
        let config = InjectionConfig {
            external_media_file: None,
            display_name: "gstreamer".to_string(),
        };

        server
            .start_injected_source("127.0.0.1".parse().unwrap(), &config)
            .await
            .unwrap();

        assert!(server.registry().is_empty().await);
        assert_eq!(launcher.launch_count(), 0);
    }
}
