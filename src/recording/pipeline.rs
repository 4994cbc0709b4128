use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SfuError};
use crate::media::SocketTuple;

/// Arguments for one `gst-launch-1.0` invocation, one element per argv slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineDescription {
    args: Vec<String>,
}

impl PipelineDescription {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Fixed fragment; split on whitespace.
    fn words(&mut self, fragment: &str) -> &mut Self {
        self.args.extend(fragment.split_whitespace().map(str::to_owned));
        self
    }

    /// Single argument that may contain spaces (paths, caps).
    fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }
}

impl<S: Into<String>> FromIterator<S> for PipelineDescription {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            args: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for PipelineDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Where the recorder receives one RTP stream and what that stream carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpEndpoint {
    pub remote_rtp_port: u16,
    pub remote_rtcp_port: u16,
    /// RTCP port of the server-side plain transport, for receiver reports.
    pub local_rtcp_port: Option<u16>,
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub ssrc: u32,
    pub cname: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerRtpParameters {
    codecs: Vec<CodecParameters>,
    encodings: Vec<EncodingParameters>,
    #[serde(default)]
    rtcp: RtcpParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodecParameters {
    mime_type: String,
    payload_type: u8,
    clock_rate: u32,
    #[serde(default)]
    channels: Option<u8>,
}

#[derive(Deserialize)]
struct EncodingParameters {
    ssrc: Option<u32>,
}

#[derive(Deserialize, Default)]
struct RtcpParameters {
    cname: Option<String>,
}

impl RtpEndpoint {
    /// Builds the endpoint from a consumer's RTP parameters: first codec,
    /// first encoding's SSRC, RTCP cname.
    pub fn from_rtp_parameters(
        remote_rtp_port: u16,
        remote_rtcp_port: u16,
        local_rtcp_port: Option<u16>,
        rtp_parameters: &Value,
    ) -> Result<Self> {
        let params = ConsumerRtpParameters::deserialize(rtp_parameters)
            .map_err(|e| SfuError::media_engine(format!("unexpected consumer RTP parameters: {e}")))?;

        let codec = params
            .codecs
            .first()
            .ok_or_else(|| SfuError::media_engine("consumer has no codec"))?;
        let ssrc = params
            .encodings
            .first()
            .and_then(|encoding| encoding.ssrc)
            .ok_or_else(|| SfuError::media_engine("consumer has no SSRC"))?;

        let codec_name = codec
            .mime_type
            .split_once('/')
            .map(|(_, subtype)| subtype)
            .unwrap_or(&codec.mime_type)
            .to_uppercase();

        Ok(Self {
            remote_rtp_port,
            remote_rtcp_port,
            local_rtcp_port,
            payload_type: codec.payload_type,
            codec_name,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            ssrc,
            cname: params.rtcp.cname.map(|cname| cname.to_uppercase()),
        })
    }

    fn caps(&self, media: &str) -> String {
        format!(
            "caps=application/x-rtp,media=(string){media},clock-rate=(int){},payload=(int){},encoding-name=(string){},ssrc=(uint){}",
            self.clock_rate, self.payload_type, self.codec_name, self.ssrc
        )
    }
}

/// Receives the two RTP streams on `host` and muxes them into a webm file.
/// `-e` makes the muxer finalise the file when the process is interrupted.
pub fn recording_pipeline(
    output: &Path,
    host: IpAddr,
    video: &RtpEndpoint,
    audio: &RtpEndpoint,
) -> PipelineDescription {
    let mut pipeline = PipelineDescription::default();

    pipeline.words("-e rtpbin name=rtpbin latency=50 buffer-mode=0");
    if let Some(cname) = &video.cname {
        pipeline.arg(format!("sdes=application/x-rtp-source-sdes,cname=(string){cname}"));
    }

    pipeline
        .arg("udpsrc")
        .arg(format!("port={}", video.remote_rtp_port))
        .arg(video.caps("video"))
        .words("! rtpbin.recv_rtp_sink_0 rtpbin. ! queue ! rtpvp8depay ! mux.");

    pipeline
        .arg("udpsrc")
        .arg(format!("port={}", audio.remote_rtp_port))
        .arg(audio.caps("audio"))
        .words("! rtpbin.recv_rtp_sink_1 rtpbin. ! queue ! rtpopusdepay ! opusdec ! opusenc ! mux.");

    pipeline
        .words("webmmux name=mux ! filesink")
        .arg(format!("location={}", output.display()));

    for (index, endpoint) in [video, audio].into_iter().enumerate() {
        let Some(local_rtcp_port) = endpoint.local_rtcp_port else {
            continue;
        };
        pipeline
            .arg("udpsrc")
            .arg(format!("address={host}"))
            .arg(format!("port={}", endpoint.remote_rtcp_port))
            .arg("!")
            .arg(format!("rtpbin.recv_rtcp_sink_{index}"))
            .arg(format!("rtpbin.send_rtcp_src_{index}"))
            .words("! udpsink")
            .arg(format!("host={host}"))
            .arg(format!("port={local_rtcp_port}"))
            .arg(format!("bind-address={host}"))
            .arg(format!("bind-port={}", endpoint.remote_rtcp_port))
            .words("sync=false async=false");
    }

    pipeline
}

/// Where the injector sends one RTP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionTarget {
    pub payload_type: u8,
    pub ssrc: u32,
    pub rtp: SocketTuple,
    pub rtcp: SocketTuple,
}

/// Demuxes `media_file`, encodes VP8 + Opus and streams both as RTP.
pub fn injection_pipeline(
    media_file: &Path,
    video: &InjectionTarget,
    audio: &InjectionTarget,
) -> PipelineDescription {
    let mut pipeline = PipelineDescription::default();

    pipeline
        .words("rtpbin name=rtpbin filesrc")
        .arg(format!("location={}", media_file.display()))
        .words("! qtdemux name=demux");

    pipeline
        .words("demux.video_0 ! queue ! decodebin ! videoconvert")
        .words("! vp8enc target-bitrate=1000000 deadline=1 cpu-used=4 ! rtpvp8pay")
        .arg(format!("pt={}", video.payload_type))
        .arg(format!("ssrc={}", video.ssrc))
        .words("picture-id-mode=2 ! rtpbin.send_rtp_sink_0");
    pipeline
        .words("rtpbin.send_rtp_src_0 ! udpsink")
        .arg(format!("host={}", video.rtp.ip))
        .arg(format!("port={}", video.rtp.port));

    pipeline
        .words("demux.audio_0 ! queue ! decodebin ! audioresample ! audioconvert")
        .words("! opusenc ! rtpopuspay")
        .arg(format!("pt={}", audio.payload_type))
        .arg(format!("ssrc={}", audio.ssrc))
        .words("! rtpbin.send_rtp_sink_1");
    pipeline
        .words("rtpbin.send_rtp_src_1 ! udpsink")
        .arg(format!("host={}", audio.rtp.ip))
        .arg(format!("port={}", audio.rtp.port));

    for (index, target) in [video, audio].into_iter().enumerate() {
        pipeline
            .arg(format!("rtpbin.send_rtcp_src_{index}"))
            .words("! udpsink")
            .arg(format!("host={}", target.rtcp.ip))
            .arg(format!("port={}", target.rtcp.port))
            .words("sync=false async=false");
    }

    pipeline
}
