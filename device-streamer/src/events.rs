use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::StatusSnapshot;

use crate::state::StreamingState;

/// Events published by a streaming session to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    StateChanged {
        session_id: Uuid,
        state: StreamingState,
    },
    StreamUrlAvailable {
        session_id: Uuid,
        url: String,
    },
    Status {
        session_id: Uuid,
        #[serde(flatten)]
        snapshot: StatusSnapshot,
    },
    /// A recoverable problem, e.g. one source of an audio/video session
    /// died. Queue overflow is only logged and counted in the upload metrics.
    Warning {
        session_id: Uuid,
        source: String,
        message: String,
    },
    ConnectionDegraded {
        session_id: Uuid,
        consecutive_failures: u32,
        #[serde(with = "crate::serde_helpers::duration_millis")]
        retry_in: Duration,
        auto_reconnect: bool,
    },
    Failed {
        session_id: Uuid,
        reason: String,
    },
}

impl StreamEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            StreamEvent::StateChanged { session_id, .. }
            | StreamEvent::StreamUrlAvailable { session_id, .. }
            | StreamEvent::Status { session_id, .. }
            | StreamEvent::Warning { session_id, .. }
            | StreamEvent::ConnectionDegraded { session_id, .. }
            | StreamEvent::Failed { session_id, .. } => *session_id,
        }
    }
}

/// Receives session events. Implementations must not block; they are called
/// inline from capture and upload tasks.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: StreamEvent);
}

/// Fan-out of events to every registered handler.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn emit(&self, event: StreamEvent) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle_event(event.clone());
        }
    }

    /// Bind the bus to one session so emitters don't carry the id around.
    pub fn for_session(&self, session_id: Uuid) -> SessionEvents {
        SessionEvents {
            bus: self.clone(),
            session_id,
        }
    }
}

/// Event emitter scoped to a single session.
#[derive(Clone)]
pub struct SessionEvents {
    bus: EventBus,
    session_id: Uuid,
}

impl SessionEvents {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn state_changed(&self, state: StreamingState) {
        self.bus
            .emit(StreamEvent::StateChanged {
                session_id: self.session_id,
                state,
            })
            .await;
    }

    pub async fn stream_url(&self, url: String) {
        self.bus
            .emit(StreamEvent::StreamUrlAvailable {
                session_id: self.session_id,
                url,
            })
            .await;
    }

    pub async fn status(&self, snapshot: StatusSnapshot) {
        self.bus
            .emit(StreamEvent::Status {
                session_id: self.session_id,
                snapshot,
            })
            .await;
    }

    pub async fn warning(&self, source: impl Into<String>, message: impl Into<String>) {
        self.bus
            .emit(StreamEvent::Warning {
                session_id: self.session_id,
                source: source.into(),
                message: message.into(),
            })
            .await;
    }

    pub async fn connection_degraded(&self, consecutive_failures: u32, retry_in: Duration, auto_reconnect: bool) {
        self.bus
            .emit(StreamEvent::ConnectionDegraded {
                session_id: self.session_id,
                consecutive_failures,
                retry_in,
                auto_reconnect,
            })
            .await;
    }

    pub async fn failed(&self, reason: impl Into<String>) {
        self.bus
            .emit(StreamEvent::Failed {
                session_id: self.session_id,
                reason: reason.into(),
            })
            .await;
    }
}

/// Forwards events into an unbounded channel, for UIs and tests that want to
/// consume them as a stream.
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelEventHandler {
    fn handle_event(&self, event: StreamEvent) {
        // The receiver going away just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

/// Writes every event to the tracing log.
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::StateChanged { session_id, state } => {
                info!(%session_id, %state, "Streaming state changed");
            }
            StreamEvent::StreamUrlAvailable { session_id, url } => {
                info!(%session_id, "Stream available at {}", url);
            }
            StreamEvent::Status { session_id, snapshot } => {
                debug!(
                    %session_id,
                    streaming = snapshot.is_streaming,
                    "{:.1} fps, {} bps",
                    snapshot.fps,
                    snapshot.bitrate_bps
                );
            }
            StreamEvent::Warning {
                session_id,
                source,
                message,
            } => {
                warn!(%session_id, source = %source, "{}", message);
            }
            StreamEvent::ConnectionDegraded {
                session_id,
                consecutive_failures,
                retry_in,
                auto_reconnect,
            } => {
                warn!(
                    %session_id,
                    consecutive_failures,
                    auto_reconnect,
                    "Connection degraded, retrying in {:?}",
                    retry_in
                );
            }
            StreamEvent::Failed { session_id, reason } => {
                error!(%session_id, "Session failed: {}", reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<StreamEvent>>);

    impl EventHandler for Recorder {
        fn handle_event(&self, event: StreamEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_every_handler_receives_events() {
        let bus = EventBus::new();
        let first = Arc::new(Recorder(Mutex::new(Vec::new())));
        let second = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.add_handler(first.clone()).await;
        bus.add_handler(second.clone()).await;

        let session = bus.for_session(Uuid::new_v4());
        session.stream_url("http://10.0.0.1:5000/video".to_string()).await;
        session.status(StatusSnapshot::STOPPED).await;

        for recorder in [&first, &second] {
            let events = recorder.0.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert!(events.iter().all(|e| e.session_id() == session.session_id()));
        }
    }

    #[tokio::test]
    async fn test_channel_handler_survives_dropped_receiver() {
        let (handler, rx) = ChannelEventHandler::new();
        drop(rx);
        handler.handle_event(StreamEvent::Failed {
            session_id: Uuid::nil(),
            reason: "gone".to_string(),
        });
    }

    #[test]
    fn test_status_event_serializes_flat() {
        let event = StreamEvent::Status {
            session_id: Uuid::nil(),
            snapshot: StatusSnapshot {
                is_streaming: true,
                fps: 30.0,
                bitrate_bps: 1_000_000,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["is_streaming"], true);
        assert_eq!(json["bitrate_bps"], 1_000_000);
    }

    #[test]
    fn test_degraded_event_serializes_millis() {
        let event = StreamEvent::ConnectionDegraded {
            session_id: Uuid::nil(),
            consecutive_failures: 3,
            retry_in: Duration::from_millis(500),
            auto_reconnect: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["retry_in"], 500);
        assert_eq!(json["consecutive_failures"], 3);
    }
}
