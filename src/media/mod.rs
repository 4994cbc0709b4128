//! Boundary to the media engine that does ICE, DTLS/SRTP and RTP forwarding.
//!
//! Capability descriptors, connection parameters and RTP parameters cross
//! this boundary as opaque JSON values; only the adapter interprets them.

#[cfg(feature = "mediasoup")]
pub mod mediasoup;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Direction of a WebRTC transport, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Receive,
}

/// Options for a plain (non-ICE) UDP transport. RTCP is never muxed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainTransportSettings {
    pub listen_ip: IpAddr,
    /// Learn the remote address from the first packet received.
    pub comedia: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTuple {
    pub ip: IpAddr,
    pub port: u16,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// The router capability descriptor handed to clients.
    fn rtp_capabilities(&self) -> Value;

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>>;

    async fn create_plain_transport(
        &self,
        settings: PlainTransportSettings,
    ) -> Result<Arc<dyn MediaTransport>>;

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    /// What the client needs to build its side of the transport
    /// (`id`, `iceParameters`, `iceCandidates`, `dtlsParameters`).
    fn connection_params(&self) -> Value;

    /// Local RTP address of a plain transport.
    fn local_tuple(&self) -> Option<SocketTuple>;

    /// Local RTCP address of a plain transport.
    fn local_rtcp_tuple(&self) -> Option<SocketTuple>;

    /// `{ "dtlsParameters": .. }` for WebRTC transports,
    /// `{ "ip": .., "port": .., "rtcpPort": .. }` for plain ones.
    async fn connect(&self, params: Value) -> Result<()>;

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> Result<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    async fn resume(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
