use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::{self, ViewerEndpoint};

/// Which media the session captures and uploads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ImageOnly,
    AudioOnly,
    VideoOnly,
    AudioVideo,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ImageOnly => "image_only",
            Mode::AudioOnly => "audio_only",
            Mode::VideoOnly => "video_only",
            Mode::AudioVideo => "audio_video",
        }
    }

    /// Whether a camera producer runs in this mode.
    pub fn captures_images(&self) -> bool {
        !matches!(self, Mode::AudioOnly)
    }

    /// Whether a microphone producer runs in this mode.
    pub fn captures_audio(&self) -> bool {
        matches!(self, Mode::AudioOnly | Mode::AudioVideo)
    }

    pub fn viewer_endpoint(&self) -> ViewerEndpoint {
        match self {
            Mode::ImageOnly => ViewerEndpoint::Image,
            Mode::AudioOnly => ViewerEndpoint::Audio,
            Mode::VideoOnly | Mode::AudioVideo => ViewerEndpoint::Video,
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::VideoOnly
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "image_only" | "image" | "img" => Ok(Mode::ImageOnly),
            "audio_only" | "audio" => Ok(Mode::AudioOnly),
            "video_only" | "video" => Ok(Mode::VideoOnly),
            "audio_video" | "av" => Ok(Mode::AudioVideo),
            _ => Err(ConfigError::UnknownMode { value: s.to_string() }),
        }
    }
}

/// Capture quality presets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low480p,
    Medium720p,
    High1080p,
}

impl Quality {
    pub fn label(&self) -> &'static str {
        match self {
            Quality::Low480p => "480p (Low)",
            Quality::Medium720p => "720p (Medium)",
            Quality::High1080p => "1080p (High)",
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            Quality::Low480p => 640,
            Quality::Medium720p => 1280,
            Quality::High1080p => 1920,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Quality::Low480p => 480,
            Quality::Medium720p => 720,
            Quality::High1080p => 1080,
        }
    }

    pub fn target_bitrate_bps(&self) -> u64 {
        match self {
            Quality::Low480p => 1_000_000,
            Quality::Medium720p => 2_500_000,
            Quality::High1080p => 5_000_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low480p => "low_480p",
            Quality::Medium720p => "medium_720p",
            Quality::High1080p => "high_1080p",
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Medium720p
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Quality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "low_480p" | "480p" | "low" => Ok(Quality::Low480p),
            "medium_720p" | "720p" | "medium" => Ok(Quality::Medium720p),
            "high_1080p" | "1080p" | "high" => Ok(Quality::High1080p),
            _ => Err(ConfigError::UnknownQuality { value: s.to_string() }),
        }
    }
}

/// Immutable description of one streaming session.
///
/// Fields are private so a `StreamConfig` can only exist with a validated
/// host and a non-zero port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStreamConfig", into = "RawStreamConfig")]
pub struct StreamConfig {
    mode: Mode,
    quality: Quality,
    host: String,
    port: u16,
}

impl StreamConfig {
    pub fn new(mode: Mode, quality: Quality, host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into().trim().to_string();
        validate_host(&host)?;
        validate_port(port)?;
        Ok(Self { mode, quality, host, port })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `http://{host}:{port}`, the base for every upload endpoint.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// URL a viewer opens to watch this session.
    pub fn viewer_url(&self) -> String {
        format!("{}/{}", self.base_url(), self.mode.viewer_endpoint().path())
    }

    pub fn upload_url(&self, kind: FrameKind) -> String {
        format!("{}{}", self.base_url(), protocol::upload_path(kind))
    }
}

#[derive(Serialize, Deserialize)]
struct RawStreamConfig {
    mode: Mode,
    quality: Quality,
    host: String,
    port: u16,
}

impl TryFrom<RawStreamConfig> for StreamConfig {
    type Error = ConfigError;

    fn try_from(raw: RawStreamConfig) -> Result<Self, Self::Error> {
        StreamConfig::new(raw.mode, raw.quality, raw.host, raw.port)
    }
}

impl From<StreamConfig> for RawStreamConfig {
    fn from(config: StreamConfig) -> Self {
        Self {
            mode: config.mode,
            quality: config.quality,
            host: config.host,
            port: config.port,
        }
    }
}

pub fn validate_port(port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::InvalidPort { port: port as u32 });
    }
    Ok(())
}

/// Accepts a dotted-quad IPv4 address or an RFC 1123 hostname.
pub fn validate_host(host: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidHost { host: host.to_string() };

    if host.is_empty() || host.len() > 253 {
        return Err(invalid());
    }

    let labels: Vec<&str> = host.split('.').collect();

    // All-numeric names must be a well-formed IPv4 address.
    if labels.iter().all(|l| !l.is_empty() && l.bytes().all(|b| b.is_ascii_digit())) {
        return if is_ipv4(&labels) { Ok(()) } else { Err(invalid()) };
    }

    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid());
        }
    }
    Ok(())
}

fn is_ipv4(labels: &[&str]) -> bool {
    labels.len() == 4
        && labels
            .iter()
            .all(|l| l.len() <= 3 && l.parse::<u16>().map(|v| v <= 255).unwrap_or(false))
}

/// Kind of captured media carried by a frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Image,
    Audio,
}

impl FrameKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            FrameKind::Image => protocol::CONTENT_TYPE_JPEG,
            FrameKind::Audio => protocol::CONTENT_TYPE_PCM,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Image => write!(f, "image"),
            FrameKind::Audio => write!(f, "audio"),
        }
    }
}

/// One discrete unit of captured media.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Bytes,
    pub kind: FrameKind,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            kind,
            captured_at: Utc::now(),
        }
    }

    pub fn image(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Image, payload)
    }

    pub fn audio(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Audio, payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Throughput reported to the presentation layer once per sample interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub is_streaming: bool,
    pub fps: f64,
    pub bitrate_bps: u64,
}

impl StatusSnapshot {
    /// Final snapshot published when a session ends.
    pub const STOPPED: StatusSnapshot = StatusSnapshot {
        is_streaming: false,
        fps: 0.0,
        bitrate_bps: 0,
    };

    /// Reduce raw counters observed over `elapsed` into rates.
    pub fn from_counts(frames: u64, bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self {
                is_streaming: true,
                fps: 0.0,
                bitrate_bps: 0,
            };
        }

        Self {
            is_streaming: true,
            fps: frames as f64 / secs,
            bitrate_bps: ((bytes as f64 * 8.0) / secs).round() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quality_presets() {
        assert_eq!(Quality::Low480p.width(), 640);
        assert_eq!(Quality::Medium720p.height(), 720);
        assert_eq!(Quality::High1080p.target_bitrate_bps(), 5_000_000);
        assert_eq!(Quality::Medium720p.label(), "720p (Medium)");
    }

    #[test]
    fn test_viewer_url_per_mode() {
        let config = StreamConfig::new(Mode::ImageOnly, Quality::Medium720p, "192.168.1.50", 5000).unwrap();
        assert_eq!(config.viewer_url(), "http://192.168.1.50:5000/img");

        let expected = [
            (Mode::AudioOnly, "http://10.0.0.2:8080/audio"),
            (Mode::VideoOnly, "http://10.0.0.2:8080/video"),
            (Mode::AudioVideo, "http://10.0.0.2:8080/video"),
        ];
        for (mode, url) in expected {
            let config = StreamConfig::new(mode, Quality::Low480p, "10.0.0.2", 8080).unwrap();
            assert_eq!(config.viewer_url(), url);
        }
    }

    #[test]
    fn test_upload_urls() {
        let config = StreamConfig::new(Mode::AudioVideo, Quality::Low480p, "streamer.local", 5000).unwrap();
        assert_eq!(config.upload_url(FrameKind::Image), "http://streamer.local:5000/upload_frame");
        assert_eq!(config.upload_url(FrameKind::Audio), "http://streamer.local:5000/upload_audio");
    }

    #[test]
    fn test_invalid_hosts_rejected() {
        for host in ["", "256.1.1.1", "1.2.3", "1.2.3.4.5", "-bad.example", "bad-.example", "a..b", "has space", "under_score"] {
            assert!(
                matches!(validate_host(host), Err(ConfigError::InvalidHost { .. })),
                "host {:?} should be rejected",
                host
            );
        }
    }

    #[test]
    fn test_valid_hosts_accepted() {
        for host in ["192.168.1.100", "0.0.0.0", "localhost", "media-server.lan", "a1.b2.example.com"] {
            assert!(validate_host(host).is_ok(), "host {:?} should be accepted", host);
        }
    }

    #[test]
    fn test_port_zero_rejected() {
        let result = StreamConfig::new(Mode::AudioOnly, Quality::Low480p, "localhost", 0);
        assert!(matches!(result, Err(ConfigError::InvalidPort { port: 0 })));
    }

    #[test]
    fn test_mode_and_quality_parsing() {
        assert_eq!("IMAGE_ONLY".parse::<Mode>().unwrap(), Mode::ImageOnly);
        assert_eq!("audio-video".parse::<Mode>().unwrap(), Mode::AudioVideo);
        assert_eq!("720p".parse::<Quality>().unwrap(), Quality::Medium720p);
        assert!("4k".parse::<Quality>().is_err());
        assert!("radio".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_capture_sources() {
        assert!(Mode::ImageOnly.captures_images() && !Mode::ImageOnly.captures_audio());
        assert!(Mode::VideoOnly.captures_images() && !Mode::VideoOnly.captures_audio());
        assert!(!Mode::AudioOnly.captures_images() && Mode::AudioOnly.captures_audio());
        assert!(Mode::AudioVideo.captures_images() && Mode::AudioVideo.captures_audio());
    }

    #[test]
    fn test_deserialize_rejects_invalid_config() {
        let json = r#"{"mode":"image_only","quality":"low_480p","host":"bad host","port":5000}"#;
        assert!(serde_json::from_str::<StreamConfig>(json).is_err());

        let json = r#"{"mode":"image_only","quality":"low_480p","host":"10.1.1.1","port":5000}"#;
        let config: StreamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.host(), "10.1.1.1");
    }

    #[test]
    fn test_snapshot_from_counts() {
        let snapshot = StatusSnapshot::from_counts(30, 125_000, Duration::from_secs_f64(1.0));
        assert!(snapshot.is_streaming);
        assert_eq!(snapshot.fps, 30.0);
        assert_eq!(snapshot.bitrate_bps, 1_000_000);
    }

    #[test]
    fn test_snapshot_tolerates_jitter_and_zero_elapsed() {
        let snapshot = StatusSnapshot::from_counts(30, 125_000, Duration::from_millis(1500));
        assert!((snapshot.fps - 20.0).abs() < 1e-9);
        assert_eq!(snapshot.bitrate_bps, 666_667);

        let snapshot = StatusSnapshot::from_counts(5, 100, Duration::ZERO);
        assert_eq!(snapshot.fps, 0.0);
        assert_eq!(snapshot.bitrate_bps, 0);
    }

    proptest! {
        #[test]
        fn prop_ipv4_addresses_are_valid_hosts(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255) {
            let host = format!("{}.{}.{}.{}", a, b, c, d);
            prop_assert!(validate_host(&host).is_ok());
        }

        #[test]
        fn prop_any_nonzero_port_builds_config(port in 1u16..=u16::MAX) {
            let config = StreamConfig::new(Mode::VideoOnly, Quality::High1080p, "localhost", port).unwrap();
            prop_assert_eq!(config.viewer_url(), format!("http://localhost:{}/video", port));
        }
    }
}
