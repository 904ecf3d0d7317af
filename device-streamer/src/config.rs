use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use common::{ConfigError, Mode, Quality, StreamConfig};

use crate::controller::SessionOptions;
use crate::uploader::{UploaderConfig, MAX_WORKERS};

/// Persisted streamer preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StreamSettings {
    pub server: ServerSettings,
    pub capture: CaptureSection,
    pub network: NetworkSettings,
    pub uploader: UploaderSettings,
    pub stats: StatsSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    /// Kept wider than `u16` so an out-of-range value is reported instead of
    /// failing the whole file.
    pub port: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    #[serde(with = "crate::serde_helpers::lenient_mode")]
    pub mode: Mode,
    #[serde(with = "crate::serde_helpers::lenient_quality")]
    pub quality: Quality,
    pub frame_rate: u32,
    pub audio_sample_rate: u32,
    pub hardware_acceleration: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub auto_reconnect: bool,
    /// Memory budget for frames waiting to be uploaded.
    pub buffer_size_kb: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub read_timeout: Duration,
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub debug_mode: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 5000,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            mode: Mode::VideoOnly,
            quality: Quality::Medium720p,
            frame_rate: 30,
            audio_sample_rate: 44_100,
            hardware_acceleration: true,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            buffer_size_kb: 2048,
        }
    }
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug_mode: false,
        }
    }
}

impl StreamSettings {
    /// Build the validated per-session configuration.
    pub fn stream_config(&self) -> Result<StreamConfig, ConfigError> {
        let port = u16::try_from(self.server.port).map_err(|_| ConfigError::InvalidPort {
            port: self.server.port,
        })?;
        StreamConfig::new(self.capture.mode, self.capture.quality, self.server.host.clone(), port)
    }

    pub fn session_options(&self) -> SessionOptions {
        let uploader = UploaderConfig {
            workers: self.uploader.workers,
            queue_capacity: self.uploader.queue_capacity,
            max_queued_bytes: self.network.buffer_size_kb as usize * 1024,
            connect_timeout: self.uploader.connect_timeout,
            read_timeout: self.uploader.read_timeout,
            shutdown_timeout: self.uploader.shutdown_timeout,
            ..UploaderConfig::default()
        };

        SessionOptions {
            frame_rate: self.capture.frame_rate,
            audio_sample_rate: self.capture.audio_sample_rate,
            hardware_acceleration: self.capture.hardware_acceleration,
            auto_reconnect: self.network.auto_reconnect,
            uploader,
            stats_interval: Duration::from_millis(self.stats.interval_ms),
            producer_stop_timeout: self.uploader.shutdown_timeout,
        }
    }

    /// Log filter to use when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &str {
        if self.logging.debug_mode {
            "debug"
        } else {
            &self.logging.level
        }
    }

    /// Flat key/value view of every preference.
    pub fn export(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("server_ip".to_string(), self.server.host.clone());
        map.insert("server_port".to_string(), self.server.port.to_string());
        map.insert("stream_mode".to_string(), self.capture.mode.as_str().to_string());
        map.insert("stream_quality".to_string(), self.capture.quality.as_str().to_string());
        map.insert("frame_rate".to_string(), self.capture.frame_rate.to_string());
        map.insert("audio_sample_rate".to_string(), self.capture.audio_sample_rate.to_string());
        map.insert(
            "hardware_acceleration".to_string(),
            self.capture.hardware_acceleration.to_string(),
        );
        map.insert("auto_reconnect".to_string(), self.network.auto_reconnect.to_string());
        map.insert("buffer_size".to_string(), self.network.buffer_size_kb.to_string());
        map.insert("debug_mode".to_string(), self.logging.debug_mode.to_string());
        map
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream_config()?;

        if self.capture.frame_rate == 0 || self.capture.frame_rate > 120 {
            return Err(ConfigError::InvalidSetting {
                field: "capture.frame_rate".to_string(),
                message: "must be between 1 and 120".to_string(),
            });
        }
        if !(8_000..=192_000).contains(&self.capture.audio_sample_rate) {
            return Err(ConfigError::InvalidSetting {
                field: "capture.audio_sample_rate".to_string(),
                message: "must be between 8000 and 192000".to_string(),
            });
        }
        if self.uploader.workers == 0 || self.uploader.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidSetting {
                field: "uploader.workers".to_string(),
                message: format!("must be between 1 and {}", MAX_WORKERS),
            });
        }
        if self.uploader.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "uploader.queue_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.network.buffer_size_kb == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "network.buffer_size_kb".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.stats.interval_ms < 100 {
            return Err(ConfigError::InvalidSetting {
                field: "stats.interval_ms".to_string(),
                message: "must be at least 100".to_string(),
            });
        }
        Ok(())
    }
}

/// Loads, saves and resets the settings file.
pub struct SettingsStore {
    path: PathBuf,
    settings: StreamSettings,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            settings: StreamSettings::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file, creating it with defaults if it does not exist yet.
    pub async fn load(&mut self) -> Result<(), ConfigError> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            info!("No settings at {}, writing defaults", self.path.display());
            self.settings = StreamSettings::default();
            return self.save().await;
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConfigError::Storage {
                message: format!("Failed to read {}: {}", self.path.display(), e),
            })?;

        self.settings = toml::from_str(&content).map_err(|e| ConfigError::Storage {
            message: format!("Failed to parse {}: {}", self.path.display(), e),
        })?;
        debug!("Loaded settings from {}", self.path.display());
        Ok(())
    }

    pub async fn save(&self) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(&self.settings).map_err(|e| ConfigError::Storage {
            message: format!("Failed to serialize settings: {}", e),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::Storage {
                    message: format!("Failed to create {}: {}", parent.display(), e),
                })?;
        }

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| ConfigError::Storage {
                message: format!("Failed to write {}: {}", self.path.display(), e),
            })
    }

    /// Restore defaults and persist them.
    pub async fn reset(&mut self) -> Result<(), ConfigError> {
        self.settings = StreamSettings::default();
        self.save().await
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut StreamSettings {
        &mut self.settings
    }

    pub fn update(&mut self, settings: StreamSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }
}

/// Environment variable overrides applied after loading.
pub struct EnvOverrides;

impl EnvOverrides {
    pub fn apply(settings: &mut StreamSettings) {
        Self::apply_from(settings, |key| std::env::var(key).ok());
    }

    pub fn apply_from<F>(settings: &mut StreamSettings, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DEVICE_STREAMER_SERVER_HOST") {
            settings.server.host = host;
        }
        if let Some(port) = lookup("DEVICE_STREAMER_SERVER_PORT").and_then(|p| p.parse::<u32>().ok()) {
            settings.server.port = port;
        }
        if let Some(mode) = lookup("DEVICE_STREAMER_MODE").and_then(|m| m.parse::<Mode>().ok()) {
            settings.capture.mode = mode;
        }
        if let Some(quality) = lookup("DEVICE_STREAMER_QUALITY").and_then(|q| q.parse::<Quality>().ok()) {
            settings.capture.quality = quality;
        }
        if let Some(level) = lookup("DEVICE_STREAMER_LOG_LEVEL") {
            settings.logging.level = level;
        }
    }
}
