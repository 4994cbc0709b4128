use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use super::peer::Peer;
use crate::error::{Result, SfuError};
use crate::media::{MediaEngine, MediaKind, MediaTransport, PlainTransportSettings};
use crate::recording::pipeline::injection_pipeline;
use crate::recording::{InjectionTarget, RecorderLauncher, RecorderProcess};

pub const VIDEO_PAYLOAD_TYPE: u8 = 102;
pub const AUDIO_PAYLOAD_TYPE: u8 = 101;
pub const VIDEO_SSRC: u32 = 2222;
pub const AUDIO_SSRC: u32 = 1111;

/// A media file streamed into the session by a local pipeline, presented to
/// clients as one more peer.
pub struct InjectedSource {
    peer: Arc<Peer>,
    transports: Vec<Arc<dyn MediaTransport>>,
    process: Box<dyn RecorderProcess>,
}

impl InjectedSource {
    pub async fn start(
        engine: &dyn MediaEngine,
        launcher: &dyn RecorderLauncher,
        listen_ip: IpAddr,
        display_name: &str,
        media_file: &Path,
    ) -> Result<Self> {
        let peer = Peer::injected_source(display_name);
        let mut transports = Vec::with_capacity(2);

        let targets = async {
            let video = open_incoming(engine, &peer, &mut transports, listen_ip, MediaKind::Video).await?;
            let audio = open_incoming(engine, &peer, &mut transports, listen_ip, MediaKind::Audio).await?;
            Ok::<_, SfuError>((video, audio))
        }
        .await;

        let launched = match targets {
            Ok((video, audio)) => {
                launcher
                    .launch(&injection_pipeline(media_file, &video, &audio))
                    .await
            }
            Err(e) => Err(e),
        };

        match launched {
            Ok(process) => {
                tracing::info!(
                    peer_id = %peer.id(),
                    file = %media_file.display(),
                    "Injected media source started"
                );
                Ok(Self {
                    peer,
                    transports,
                    process,
                })
            }
            Err(e) => {
                release(&peer, transports).await;
                Err(e)
            }
        }
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub async fn stop(mut self) {
        self.process.stop().await;
        release(&self.peer, self.transports).await;
        tracing::info!(peer_id = %self.peer.id(), "Injected media source stopped");
    }
}

/// Opens a comedia plain transport and a producer with the fixed payload
/// type and SSRC the pipeline will send.
async fn open_incoming(
    engine: &dyn MediaEngine,
    peer: &Peer,
    transports: &mut Vec<Arc<dyn MediaTransport>>,
    listen_ip: IpAddr,
    kind: MediaKind,
) -> Result<InjectionTarget> {
    let (payload_type, ssrc) = match kind {
        MediaKind::Video => (VIDEO_PAYLOAD_TYPE, VIDEO_SSRC),
        MediaKind::Audio => (AUDIO_PAYLOAD_TYPE, AUDIO_SSRC),
    };

    let transport = engine
        .create_plain_transport(PlainTransportSettings {
            listen_ip,
            comedia: true,
        })
        .await?;
    transports.push(transport.clone());

    let rtp_parameters = producer_rtp_parameters(engine, kind, payload_type, ssrc)?;
    let producer = transport.produce(kind, rtp_parameters).await?;
    peer.media().await.producers.insert(producer.id(), producer);

    let rtp = transport
        .local_tuple()
        .ok_or_else(|| SfuError::media_engine("plain transport has no local tuple"))?;
    let rtcp = transport
        .local_rtcp_tuple()
        .ok_or_else(|| SfuError::media_engine("plain transport has no local RTCP tuple"))?;

    Ok(InjectionTarget {
        payload_type,
        ssrc,
        rtp,
        rtcp,
    })
}

/// RTP parameters for the router's codec of `kind`, pinned to the payload
/// type and SSRC the pipeline uses.
fn producer_rtp_parameters(
    engine: &dyn MediaEngine,
    kind: MediaKind,
    payload_type: u8,
    ssrc: u32,
) -> Result<Value> {
    let capabilities = engine.rtp_capabilities();
    let kind_name = kind.to_string();
    let codec = capabilities["codecs"]
        .as_array()
        .and_then(|codecs| {
            codecs
                .iter()
                .find(|codec| codec["kind"].as_str() == Some(kind_name.as_str()))
        })
        .ok_or_else(|| SfuError::media_engine(format!("router has no {kind} codec")))?;

    let mut codec_parameters = json!({
        "mimeType": codec["mimeType"],
        "payloadType": payload_type,
        "clockRate": codec["clockRate"],
        "parameters": codec.get("parameters").cloned().unwrap_or_else(|| json!({})),
    });
    if let Some(channels) = codec.get("channels") {
        codec_parameters["channels"] = channels.clone();
    }

    Ok(json!({
        "codecs": [codec_parameters],
        "encodings": [{ "ssrc": ssrc }],
    }))
}

async fn release(peer: &Peer, transports: Vec<Arc<dyn MediaTransport>>) {
    peer.close_media().await;
    for transport in transports {
        if let Err(e) = transport.close().await {
            tracing::warn!(transport_id = %transport.id(), error = %e, "Failed to close injection transport");
        }
    }
}
