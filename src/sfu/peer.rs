use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::media::{MediaConsumer, MediaKind, MediaProducer, MediaTransport};
use crate::rpc::RpcChannel;

/// What kind of participant a peer is.
pub enum PeerKind {
    /// A connected client, reachable through its channel.
    Human(RpcChannel),
    /// Media injected by the server itself; has no connection.
    InjectedSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDetails {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct PeerProfile {
    pub display_name: String,
    pub rtp_capabilities: Option<Value>,
}

/// Media objects owned by one peer.
#[derive(Default)]
pub struct PeerMedia {
    pub producer_transport: Option<Arc<dyn MediaTransport>>,
    pub consumer_transport: Option<Arc<dyn MediaTransport>>,
    pub producers: HashMap<String, Arc<dyn MediaProducer>>,
    pub consumers: HashMap<String, Arc<dyn MediaConsumer>>,
}

pub struct Peer {
    id: String,
    kind: PeerKind,
    profile: RwLock<PeerProfile>,
    media: Mutex<PeerMedia>,
}

impl Peer {
    pub fn human(channel: RpcChannel) -> Arc<Self> {
        Arc::new(Self::with_kind(PeerKind::Human(channel), String::new()))
    }

    pub fn injected_source(display_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::with_kind(PeerKind::InjectedSource, display_name.into()))
    }

    fn with_kind(kind: PeerKind, display_name: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            profile: RwLock::new(PeerProfile {
                display_name,
                rtp_capabilities: None,
            }),
            media: Mutex::new(PeerMedia::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &PeerKind {
        &self.kind
    }

    pub fn is_injected(&self) -> bool {
        matches!(self.kind, PeerKind::InjectedSource)
    }

    /// Sends a notification to the peer's client. Injected peers have no
    /// client, so this is a no-op for them.
    pub fn notify(&self, method: &str, data: Value) {
        if let PeerKind::Human(channel) = &self.kind {
            channel.notify(method, data);
        }
    }

    pub async fn set_profile(&self, display_name: String, rtp_capabilities: Value) {
        let mut profile = self.profile.write().await;
        profile.display_name = display_name;
        profile.rtp_capabilities = Some(rtp_capabilities);
    }

    pub async fn display_name(&self) -> String {
        self.profile.read().await.display_name.clone()
    }

    pub async fn rtp_capabilities(&self) -> Option<Value> {
        self.profile.read().await.rtp_capabilities.clone()
    }

    pub async fn details(&self) -> PeerDetails {
        PeerDetails {
            id: self.id.clone(),
            display_name: self.display_name().await,
        }
    }

    pub async fn media(&self) -> MutexGuard<'_, PeerMedia> {
        self.media.lock().await
    }

    pub async fn producers(&self) -> Vec<Arc<dyn MediaProducer>> {
        self.media.lock().await.producers.values().cloned().collect()
    }

    /// The first video producer and the first non-video producer found.
    pub async fn recording_sources(
        &self,
    ) -> (Option<Arc<dyn MediaProducer>>, Option<Arc<dyn MediaProducer>>) {
        let media = self.media.lock().await;
        let video = media
            .producers
            .values()
            .find(|producer| producer.kind() == MediaKind::Video)
            .cloned();
        let audio = media
            .producers
            .values()
            .find(|producer| producer.kind() != MediaKind::Video)
            .cloned();
        (video, audio)
    }

    /// Forgets consumers fed by any of `producer_ids`. The engine closes
    /// those consumers itself when their producer goes away.
    pub async fn drop_consumers_of(&self, producer_ids: &HashSet<String>) -> usize {
        let mut media = self.media.lock().await;
        let before = media.consumers.len();
        media
            .consumers
            .retain(|_, consumer| !producer_ids.contains(&consumer.producer_id()));
        before - media.consumers.len()
    }

    /// Closes every consumer, producer and transport the peer owns. Each step
    /// is independent; failures are logged and the rest still run.
    pub async fn close_media(&self) {
        let media = std::mem::take(&mut *self.media.lock().await);

        for (consumer_id, consumer) in media.consumers {
            if let Err(e) = consumer.close().await {
                tracing::warn!(peer_id = %self.id, consumer_id = %consumer_id, error = %e, "Failed to close consumer");
            }
        }

        for (producer_id, producer) in media.producers {
            if let Err(e) = producer.close().await {
                tracing::warn!(peer_id = %self.id, producer_id = %producer_id, error = %e, "Failed to close producer");
            }
        }

        let transports = [
            ("producer", media.producer_transport),
            ("consumer", media.consumer_transport),
        ];
        for (role, transport) in transports {
            if let Some(transport) = transport {
                if let Err(e) = transport.close().await {
                    tracing::warn!(
                        peer_id = %self.id,
                        transport = role,
                        error = %e,
                        "Failed to close transport"
                    );
                }
            }
        }
    }
}
