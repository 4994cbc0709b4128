use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SfuError};

pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub recording: RecordingConfig,
    pub injection: InjectionConfig,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where the media engine listens for ICE/DTLS traffic.
pub struct MediaConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: IpAddr,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
    pub gstreamer_cwd: PathBuf,
    pub gst_launch_bin: String,
    pub warmup: Duration,
    pub listen_ip: IpAddr,
}

#[derive(Debug, Clone)]
pub struct InjectionConfig {
    pub external_media_file: Option<PathBuf>,
    pub display_name: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from("./recordings"),
            gstreamer_cwd: PathBuf::from("."),
            gst_launch_bin: "gst-launch-1.0".to_string(),
            warmup: Duration::from_millis(1000),
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let listen_ip = match env::var("WRTC_IP") {
            Ok(ip) if !ip.trim().is_empty() => parse_value::<IpAddr>("WRTC_IP", ip.trim())?,
            _ => return Err(SfuError::MissingConfiguration("WRTC_IP".to_string())),
        };

        let announced_ip = match env::var("WRTC_ANNOUNCED_IP") {
            Ok(ip) if !ip.trim().is_empty() => {
                parse_value::<IpAddr>("WRTC_ANNOUNCED_IP", ip.trim())?
            }
            _ => listen_ip,
        };

        let recording_defaults = RecordingConfig::default();

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("SERVER_PORT", 8080)?,
            },
            media: MediaConfig {
                listen_ip,
                announced_ip,
                port: env_or("WRTC_PORT", 44444)?,
                log_level: env::var("MEDIASOUP_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string()),
            },
            recording: RecordingConfig {
                enabled: env::var("RECORDING_ENABLED")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()
                    .unwrap_or(true),
                output_dir: env::var("RECORDING_OUTPUT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(recording_defaults.output_dir),
                gstreamer_cwd: env::var("GSTREAMER_CWD")
                    .map(PathBuf::from)
                    .unwrap_or(recording_defaults.gstreamer_cwd),
                gst_launch_bin: env::var("GST_LAUNCH_BIN")
                    .unwrap_or(recording_defaults.gst_launch_bin),
                warmup: Duration::from_millis(env_or("RECORDING_WARMUP_MS", 1000)?),
                listen_ip: env_or("RECORDING_LISTEN_IP", recording_defaults.listen_ip)?,
            },
            injection: InjectionConfig {
                external_media_file: env::var("EXTERNAL_MEDIA_FILE")
                    .ok()
                    .filter(|path| !path.trim().is_empty())
                    .map(PathBuf::from),
                display_name: env::var("EXTERNAL_MEDIA_NAME")
                    .unwrap_or_else(|_| "gstreamer".to_string()),
            },
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::UNSPECIFIED;
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::LOCALHOST,
            "" | "0.0.0.0" => Ipv4Addr::UNSPECIFIED,
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::UNSPECIFIED
            }
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => parse_value(key, raw.trim()),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| SfuError::ConfigurationParseFailed(format!("{key}={raw}")))
}
