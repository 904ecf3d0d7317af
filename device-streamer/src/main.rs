use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use device_streamer::app::{init_logging, AppBuilder, DEFAULT_SETTINGS_FILE};
use device_streamer::config::{EnvOverrides, SettingsStore};
use device_streamer::events::{EventHandler, StreamEvent};
use device_streamer::transport::probe_server;
use device_streamer::{Mode, Quality};

#[derive(Parser)]
#[command(name = "device-streamer", version, about = "Stream camera and microphone captures to an HTTP ingest server")]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a session and stream until Ctrl+C
    Stream {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// image_only, audio_only, video_only or audio_video
        #[arg(long)]
        mode: Option<Mode>,
        /// low_480p, medium_720p or high_1080p
        #[arg(long)]
        quality: Option<Quality>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Check that the ingest server accepts TCP connections
    Probe {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Inspect or reset the settings file
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Reset,
}

/// Prints events to stdout for the terminal user.
struct ConsoleEventHandler {
    json: bool,
}

impl EventHandler for ConsoleEventHandler {
    fn handle_event(&self, event: StreamEvent) {
        if self.json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
            return;
        }

        match event {
            StreamEvent::StreamUrlAvailable { url, .. } => println!("Viewer URL: {}", url),
            StreamEvent::Status { snapshot, .. } if snapshot.is_streaming => {
                println!("{:>6.1} fps  {:>10} bps", snapshot.fps, snapshot.bitrate_bps);
            }
            StreamEvent::Status { .. } => {}
            StreamEvent::StateChanged { state, .. } => println!("State: {}", state),
            StreamEvent::Warning { source, message, .. } => eprintln!("Warning [{}]: {}", source, message),
            StreamEvent::ConnectionDegraded {
                consecutive_failures,
                retry_in,
                ..
            } => eprintln!(
                "Connection degraded after {} failures, retrying in {:?}",
                consecutive_failures, retry_in
            ),
            StreamEvent::Failed { reason, .. } => eprintln!("Stream failed: {}", reason),
        }
    }
}

async fn load_settings(path: &Path) -> Result<SettingsStore> {
    let mut store = SettingsStore::new(path);
    store
        .load()
        .await
        .with_context(|| format!("loading settings from {}", path.display()))?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stream {
            host,
            port,
            mode,
            quality,
            duration,
            json,
        } => {
            let store = load_settings(&cli.config).await?;
            let mut settings = store.settings().clone();
            EnvOverrides::apply(&mut settings);
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port as u32;
            }
            if let Some(mode) = mode {
                settings.capture.mode = mode;
            }
            if let Some(quality) = quality {
                settings.capture.quality = quality;
            }

            let app = AppBuilder::new()
                .with_settings(settings)
                .with_env_overrides(false)
                .with_event_handler(Arc::new(ConsoleEventHandler { json }))
                .build()
                .await
                .context("invalid streaming settings")?;

            let summary = app.run(duration.map(Duration::from_secs)).await?;
            println!(
                "Uploaded {} of {} frames ({} dropped, {} HTTP errors, {} network errors)",
                summary.uploaded,
                summary.submitted,
                summary.dropped_overflow,
                summary.http_errors,
                summary.network_errors
            );
        }
        Command::Probe { host, port, timeout } => {
            let store = load_settings(&cli.config).await?;
            let mut settings = store.settings().clone();
            EnvOverrides::apply(&mut settings);
            init_logging(settings.log_filter());

            let host = host.unwrap_or(settings.server.host);
            let port = match port {
                Some(port) => port,
                None => u16::try_from(settings.server.port).context("configured port is out of range")?,
            };

            let rtt = probe_server(&host, port, Duration::from_secs(timeout))
                .await
                .with_context(|| format!("{}:{} is not reachable", host, port))?;
            println!("{}:{} reachable in {:?}", host, port, rtt);
        }
        Command::Settings { action } => {
            let mut store = load_settings(&cli.config).await?;
            if let SettingsAction::Reset = action {
                store.reset().await?;
                println!("Settings reset to defaults");
            }
            println!("# {}", store.path().display());
            for (key, value) in store.settings().export() {
                println!("{} = {}", key, value);
            }
        }
    }

    Ok(())
}
