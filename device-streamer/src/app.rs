use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::capture::CaptureDevices;
use crate::config::{EnvOverrides, SettingsStore, StreamSettings};
use crate::controller::{SessionHandle, StreamController};
use crate::errors::StreamError;
use crate::events::{EventHandler, LoggingEventHandler};
use crate::state::StreamingState;
use crate::synthetic::SyntheticDevices;
use crate::uploader::UploadSummary;

pub const DEFAULT_SETTINGS_FILE: &str = "device_streamer.toml";

/// Install the global tracing subscriber. `RUST_LOG` wins over `fallback`.
/// Calling this more than once is harmless.
pub fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Wires settings, devices and event handlers into a `StreamingApp`.
pub struct AppBuilder {
    settings_path: Option<PathBuf>,
    custom_settings: Option<StreamSettings>,
    devices: Option<Arc<dyn CaptureDevices>>,
    event_handlers: Vec<Arc<dyn EventHandler>>,
    enable_env_overrides: bool,
    enable_logging: bool,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            settings_path: None,
            custom_settings: None,
            devices: None,
            event_handlers: Vec::new(),
            enable_env_overrides: true,
            enable_logging: true,
        }
    }

    pub fn with_settings_path(mut self, path: PathBuf) -> Self {
        self.settings_path = Some(path);
        self
    }

    /// Use these settings instead of reading a file.
    pub fn with_settings(mut self, settings: StreamSettings) -> Self {
        self.custom_settings = Some(settings);
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn CaptureDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    pub fn with_env_overrides(mut self, enable: bool) -> Self {
        self.enable_env_overrides = enable;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    pub async fn build(self) -> Result<StreamingApp, StreamError> {
        let mut settings = match self.custom_settings {
            Some(settings) => settings,
            None => {
                let path = self
                    .settings_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
                let mut store = SettingsStore::new(path);
                store.load().await?;
                store.settings().clone()
            }
        };

        if self.enable_env_overrides {
            EnvOverrides::apply(&mut settings);
        }
        settings.validate()?;

        if self.enable_logging {
            init_logging(settings.log_filter());
        }

        let devices = self.devices.unwrap_or_else(|| Arc::new(SyntheticDevices));
        let controller = StreamController::new(devices, settings.session_options());

        if self.event_handlers.is_empty() {
            controller.add_event_handler(Arc::new(LoggingEventHandler)).await;
        }
        for handler in self.event_handlers {
            controller.add_event_handler(handler).await;
        }

        Ok(StreamingApp { settings, controller })
    }
}

pub struct StreamingApp {
    settings: StreamSettings,
    controller: StreamController,
}

impl StreamingApp {
    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    pub async fn start(&self) -> Result<SessionHandle, StreamError> {
        let config = self.settings.stream_config()?;
        self.controller.start(config).await
    }

    /// Stream until Ctrl+C, or until `duration` elapses if given. A session
    /// that fails on its own is reported as `StreamError::SessionFailed`.
    pub async fn run(&self, duration: Option<Duration>) -> Result<UploadSummary, StreamError> {
        let handle = self.start().await?;
        info!("Streaming to {} (Ctrl+C to stop)", handle.viewer_url);

        let mut state = self.controller.subscribe_state();
        let ended = async move {
            let _ = state.wait_for(|s| s.is_terminal()).await;
        };
        let limit = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutdown signal received");
            }
            _ = limit => info!("Requested duration elapsed"),
            _ = ended => {
                warn!("Session ended on its own: {}", self.controller.state());
            }
        }

        self.controller.stop(&handle).await?;
        if let StreamingState::Failed(reason) = self.controller.state() {
            return Err(StreamError::SessionFailed { reason });
        }
        Ok(self.controller.upload_metrics().await.unwrap_or_default())
    }

    pub async fn shutdown(&self) -> Result<(), StreamError> {
        self.controller.shutdown().await
    }
}
