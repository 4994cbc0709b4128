use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::peer::{Peer, PeerDetails};
use super::server::SfuServer;
use crate::error::{Result, SfuError};
use crate::media::{MediaKind, MediaTransport, TransportDirection};
use crate::rpc::message::empty_object;
use crate::rpc::{Responder, RpcHandler};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub peer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub rtp_capabilities: Value,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumer {
    pub consumer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDetails {
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// `peerJoined` notification payload.
pub type PeerJoined = PeerDetails;

/// `peerLeft` notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLeft {
    pub id: String,
}

/// `setAvailablePeers` notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailablePeers {
    pub other_peer_details: Vec<PeerDetails>,
}

/// Requests a client may send.
#[derive(Debug, Clone)]
pub enum SignalingRequest {
    GetRouterRtpCapabilities,
    CreateProducerTransport,
    ConnectProducerTransport(ConnectTransport),
    Produce(ProduceRequest),
    CreateConsumerTransport,
    ConnectConsumerTransport(ConnectTransport),
    Consume(ConsumeRequest),
    Join(JoinRequest),
}

impl SignalingRequest {
    pub fn parse(method: &str, data: Value) -> Result<Self> {
        let request = match method {
            "getRouterRtpCapabilities" => Self::GetRouterRtpCapabilities,
            "createProducerTransport" => Self::CreateProducerTransport,
            "connectProducerTransport" => Self::ConnectProducerTransport(payload(method, data)?),
            "produce" => Self::Produce(payload(method, data)?),
            "createConsumerTransport" => Self::CreateConsumerTransport,
            "connectConsumerTransport" => Self::ConnectConsumerTransport(payload(method, data)?),
            "consume" => Self::Consume(payload(method, data)?),
            "join" => Self::Join(payload(method, data)?),
            other => return Err(SfuError::UnknownMethod(other.to_string())),
        };
        Ok(request)
    }
}

fn payload<T: DeserializeOwned>(method: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| SfuError::InvalidSignalingMessage(format!("{}: {}", method, e)))
}

enum Outcome {
    Reply(Value),
    /// Registered; carries the peers that were already present.
    Joined(Vec<Arc<Peer>>),
}

/// Per-connection signaling state machine. Owns the connection's peer from
/// accept until close; the peer only becomes visible to others on `join`.
pub struct SignalingHandler {
    peer: Arc<Peer>,
    server: Arc<SfuServer>,
}

impl SignalingHandler {
    pub fn new(peer: Arc<Peer>, server: Arc<SfuServer>) -> Self {
        Self { peer, server }
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    async fn handle_request(&self, request: SignalingRequest) -> Result<Outcome> {
        let data = match request {
            SignalingRequest::GetRouterRtpCapabilities => self.server.engine().rtp_capabilities(),
            SignalingRequest::CreateProducerTransport => {
                self.create_transport(TransportDirection::Send).await?
            }
            SignalingRequest::ConnectProducerTransport(connect) => {
                self.connect_transport(TransportDirection::Send, connect).await?;
                empty_object()
            }
            SignalingRequest::Produce(produce) => self.produce(produce).await?,
            SignalingRequest::CreateConsumerTransport => {
                self.create_transport(TransportDirection::Receive).await?
            }
            SignalingRequest::ConnectConsumerTransport(connect) => {
                self.connect_transport(TransportDirection::Receive, connect).await?;
                empty_object()
            }
            SignalingRequest::Consume(consume) => self.consume(consume).await?,
            SignalingRequest::Join(join) => return Ok(Outcome::Joined(self.join(join).await)),
        };

        Ok(Outcome::Reply(data))
    }

    async fn create_transport(&self, direction: TransportDirection) -> Result<Value> {
        let mut media = self.peer.media().await;
        let slot = match direction {
            TransportDirection::Send => &mut media.producer_transport,
            TransportDirection::Receive => &mut media.consumer_transport,
        };

        if slot.is_some() {
            return Err(match direction {
                TransportDirection::Send => SfuError::ProducerTransportExists,
                TransportDirection::Receive => SfuError::ConsumerTransportExists,
            });
        }

        let transport = self.server.engine().create_webrtc_transport(direction).await?;
        let params = transport.connection_params();
        tracing::debug!(
            peer_id = %self.peer.id(),
            transport_id = %transport.id(),
            direction = ?direction,
            "Created transport"
        );
        *slot = Some(transport);
        Ok(params)
    }

    async fn own_transport(&self, direction: TransportDirection) -> Result<Arc<dyn MediaTransport>> {
        let media = self.peer.media().await;
        match direction {
            TransportDirection::Send => media
                .producer_transport
                .clone()
                .ok_or(SfuError::NoProducerTransport),
            TransportDirection::Receive => media
                .consumer_transport
                .clone()
                .ok_or(SfuError::NoConsumerTransport),
        }
    }

    async fn connect_transport(&self, direction: TransportDirection, connect: ConnectTransport) -> Result<()> {
        let transport = self.own_transport(direction).await?;
        transport
            .connect(json!({ "dtlsParameters": connect.dtls_parameters }))
            .await
    }

    async fn produce(&self, produce: ProduceRequest) -> Result<Value> {
        let mut media = self.peer.media().await;
        let transport = media
            .producer_transport
            .clone()
            .ok_or(SfuError::NoProducerTransport)?;

        if transport.id() != produce.transport_id {
            return Err(SfuError::InvalidTransportId(produce.transport_id));
        }

        let producer = transport.produce(produce.kind, produce.rtp_parameters).await?;
        let producer_id = producer.id();
        tracing::info!(
            peer_id = %self.peer.id(),
            producer_id = %producer_id,
            kind = %produce.kind,
            "Peer started producing"
        );
        media.producers.insert(producer_id.clone(), producer);

        Ok(json!({ "id": producer_id }))
    }

    /// Creates one consumer per producer of the named peer. Compatibility is
    /// checked for every producer before anything is created. Video starts
    /// paused until the client sends `resumeConsumer`.
    async fn consume(&self, consume: ConsumeRequest) -> Result<Value> {
        let target = self
            .server
            .registry()
            .get(&consume.peer_id)
            .await
            .ok_or(SfuError::InvalidPeer(consume.peer_id))?;
        let transport = self.own_transport(TransportDirection::Receive).await?;
        let capabilities = self.peer.rtp_capabilities().await.ok_or(SfuError::NotJoined)?;

        let producers = target.producers().await;
        let engine = self.server.engine();
        if let Some(producer) = producers
            .iter()
            .find(|producer| !engine.can_consume(&producer.id(), &capabilities))
        {
            return Err(SfuError::CannotConsume(producer.id()));
        }

        let mut details = Vec::with_capacity(producers.len());
        for producer in producers {
            let paused = producer.kind() == MediaKind::Video;
            let consumer = transport
                .consume(&producer.id(), capabilities.clone(), paused)
                .await?;

            details.push(ConsumerDetails {
                producer_id: producer.id(),
                id: consumer.id(),
                kind: consumer.kind(),
                rtp_parameters: consumer.rtp_parameters(),
            });
            self.peer.media().await.consumers.insert(consumer.id(), consumer);
        }

        tracing::debug!(
            peer_id = %self.peer.id(),
            target_peer_id = %target.id(),
            consumers = details.len(),
            "Created consumers"
        );
        Ok(json!({ "consumerDetailsArray": details }))
    }

    /// Stores the profile and registers the peer. Returns everyone who was
    /// already registered.
    async fn join(&self, join: JoinRequest) -> Vec<Arc<Peer>> {
        tracing::info!(peer_id = %self.peer.id(), display_name = %join.display_name, "Peer joined");
        self.peer
            .set_profile(join.display_name, join.rtp_capabilities)
            .await;
        self.server.registry().join(self.peer.clone()).await
    }

    async fn resume_consumer(&self, resume: ResumeConsumer) -> Result<()> {
        let consumer = self
            .peer
            .media()
            .await
            .consumers
            .get(&resume.consumer_id)
            .cloned()
            .ok_or(SfuError::ConsumerNotFound(resume.consumer_id))?;
        consumer.resume().await
    }
}

#[async_trait]
impl RpcHandler for SignalingHandler {
    async fn on_request(&self, method: String, data: Value, responder: Responder) {
        let result = match SignalingRequest::parse(&method, data) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Outcome::Reply(data)) => responder.accept(data),
            Ok(Outcome::Joined(others)) => {
                // Acknowledge before the presence broadcasts go out.
                responder.accept(empty_object());
                self.server.announce_join(&self.peer, others).await;
            }
            Err(e) => {
                if e.is_precondition() {
                    tracing::warn!(peer_id = %self.peer.id(), method = %method, error = %e, "Rejected request");
                } else {
                    tracing::error!(peer_id = %self.peer.id(), method = %method, error = %e, "Request failed");
                }
                responder.reject(e.client_message());
            }
        }
    }

    async fn on_notification(&self, method: String, data: Value) {
        let result = match method.as_str() {
            "resumeConsumer" => match payload::<ResumeConsumer>(&method, data) {
                Ok(resume) => self.resume_consumer(resume).await,
                Err(e) => Err(e),
            },
            other => {
                tracing::debug!(peer_id = %self.peer.id(), method = %other, "Ignoring notification");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(peer_id = %self.peer.id(), method = %method, error = %e, "Notification failed");
        }
    }

    async fn on_close(&self) {
        self.server.handle_disconnect(&self.peer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_methods() {
        assert!(matches!(
            SignalingRequest::parse("getRouterRtpCapabilities", json!({})).unwrap(),
            SignalingRequest::GetRouterRtpCapabilities
        ));

        let produce = SignalingRequest::parse(
            "produce",
            json!({ "transportId": "t1", "kind": "video", "rtpParameters": {} }),
        )
        .unwrap();
        match produce {
            SignalingRequest::Produce(produce) => {
                assert_eq!(produce.transport_id, "t1");
                assert_eq!(produce.kind, MediaKind::Video);
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let join = SignalingRequest::parse(
            "join",
            json!({ "rtpCapabilities": { "codecs": [] }, "displayName": "ada" }),
        )
        .unwrap();
        assert!(matches!(join, SignalingRequest::Join(JoinRequest { ref display_name, .. }) if display_name == "ada"));
    }

    #[test]
    fn test_parse_rejects_unknown_method() {
        let err = SignalingRequest::parse("fly", json!({})).unwrap_err();
        assert!(matches!(err, SfuError::UnknownMethod(m) if m == "fly"));
    }

    #[test]
    fn test_parse_rejects_malformed_payload() {
        let err = SignalingRequest::parse("consume", json!({ "peer": 1 })).unwrap_err();
        assert!(matches!(err, SfuError::InvalidSignalingMessage(_)));

        let err = SignalingRequest::parse(
            "produce",
            json!({ "transportId": "t1", "kind": "screen", "rtpParameters": {} }),
        )
        .unwrap_err();
        assert!(matches!(err, SfuError::InvalidSignalingMessage(_)));
    }

    #[test]
    fn test_notification_payloads_use_wire_names() {
        let available = AvailablePeers {
            other_peer_details: vec![PeerDetails {
                id: "p1".to_string(),
                display_name: "ada".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_value(available).unwrap(),
            json!({ "otherPeerDetails": [{ "id": "p1", "displayName": "ada" }] })
        );

        let details = ConsumerDetails {
            producer_id: "pr".to_string(),
            id: "c".to_string(),
            kind: MediaKind::Audio,
            rtp_parameters: json!({}),
        };
        assert_eq!(
            serde_json::to_value(details).unwrap(),
            json!({ "producerId": "pr", "id": "c", "kind": "audio", "rtpParameters": {} })
        );
    }
}
