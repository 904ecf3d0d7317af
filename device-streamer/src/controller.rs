use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::{StatusSnapshot, StreamConfig};

use crate::capture::CaptureDevices;
use crate::errors::{Result, StateError};
use crate::events::{EventBus, EventHandler, SessionEvents};
use crate::producer::{self, FrameProducer, ProducerSettings};
use crate::state::{StateMachine, StreamingState};
use crate::stats::{Counters, StatsSampler};
use crate::transport::HttpTransport;
use crate::uploader::{FrameSink, UploadSummary, Uploader, UploaderConfig};

/// Everything a session needs besides the `StreamConfig`. Read once when the
/// controller is built.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub frame_rate: u32,
    pub audio_sample_rate: u32,
    pub hardware_acceleration: bool,
    pub auto_reconnect: bool,
    pub uploader: UploaderConfig,
    pub stats_interval: Duration,
    /// How long `stop` waits for capture to wind down before abandoning the
    /// producer task.
    pub producer_stop_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            audio_sample_rate: 44_100,
            hardware_acceleration: true,
            auto_reconnect: true,
            uploader: UploaderConfig::default(),
            stats_interval: Duration::from_secs(1),
            producer_stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Returned by `start`; identifies the session for `stop`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub viewer_url: String,
    pub config: StreamConfig,
}

struct ActiveSession {
    handle: SessionHandle,
    events: SessionEvents,
    cancel: CancellationToken,
    uploader: Uploader,
    producer: JoinHandle<()>,
    sampler: JoinHandle<()>,
    // Cancels every task of the session if the controller is dropped while
    // streaming.
    _cancel_on_drop: DropGuard,
}

#[derive(Default)]
struct Lifecycle {
    active: Option<ActiveSession>,
    finished: Option<Uuid>,
    last_summary: Option<UploadSummary>,
}

struct Inner {
    state: StateMachine,
    lifecycle: Mutex<Lifecycle>,
    events: EventBus,
    devices: Arc<dyn CaptureDevices>,
    options: SessionOptions,
}

/// Owns the streaming lifecycle: at most one session at a time.
#[derive(Clone)]
pub struct StreamController {
    inner: Arc<Inner>,
}

impl StreamController {
    pub fn new(devices: Arc<dyn CaptureDevices>, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: StateMachine::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
                events: EventBus::new(),
                devices,
                options,
            }),
        }
    }

    pub fn state(&self) -> StreamingState {
        self.inner.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamingState> {
        self.inner.state.subscribe()
    }

    pub async fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.events.add_handler(handler).await;
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub async fn active_session(&self) -> Option<SessionHandle> {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.active.as_ref().map(|active| active.handle.clone())
    }

    /// Upload counters of the running session, or of the last one to finish.
    pub async fn upload_metrics(&self) -> Option<UploadSummary> {
        let lifecycle = self.inner.lifecycle.lock().await;
        match &lifecycle.active {
            Some(active) => Some(active.uploader.metrics()),
            None => lifecycle.last_summary,
        }
    }

    pub async fn start(&self, config: StreamConfig) -> Result<SessionHandle> {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        self.inner
            .state
            .transition(StreamingState::can_start, StreamingState::Starting)
            .map_err(|current| StateError::AlreadyStreaming {
                state: current.to_string(),
            })?;

        let session_id = Uuid::new_v4();
        let events = self.inner.events.for_session(session_id);
        events.state_changed(StreamingState::Starting).await;
        info!(
            %session_id,
            mode = %config.mode(),
            quality = %config.quality(),
            "Starting stream to {}",
            config.base_url()
        );

        match self.launch(session_id, config, events.clone()).await {
            Ok(active) => {
                let handle = active.handle.clone();
                lifecycle.active = Some(active);

                if self
                    .inner
                    .state
                    .transition(|s| *s == StreamingState::Starting, StreamingState::Streaming)
                    .is_ok()
                {
                    events.state_changed(StreamingState::Streaming).await;
                }
                events.stream_url(handle.viewer_url.clone()).await;
                info!(%session_id, "Streaming, viewer at {}", handle.viewer_url);
                Ok(handle)
            }
            Err(err) => {
                let reason = err.to_string();
                error!(%session_id, "Failed to start stream: {}", reason);
                let failed = StreamingState::Failed(reason.clone());
                if self
                    .inner
                    .state
                    .transition(StreamingState::is_active, failed.clone())
                    .is_ok()
                {
                    events.state_changed(failed).await;
                }
                events.failed(reason).await;
                events.status(StatusSnapshot::STOPPED).await;
                lifecycle.finished = Some(session_id);
                Err(err)
            }
        }
    }

    /// Build the pipeline for one session. On error everything created so
    /// far has already been released.
    async fn launch(&self, session_id: Uuid, config: StreamConfig, events: SessionEvents) -> Result<ActiveSession> {
        let options = &self.inner.options;
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::new());

        let transport = HttpTransport::new(
            &config,
            options.uploader.connect_timeout,
            options.uploader.read_timeout,
        )?;
        let uploader = Uploader::start(
            &options.uploader,
            Arc::new(transport),
            counters.clone(),
            events.clone(),
            options.auto_reconnect,
            cancel.child_token(),
        );

        let settings = ProducerSettings::new(
            config.mode(),
            config.quality(),
            options.frame_rate,
            options.audio_sample_rate,
            options.hardware_acceleration,
        );
        let mut source = producer::for_mode(config.mode(), self.inner.devices.as_ref(), &settings, events.clone());
        let sink = uploader.sink();

        if let Err(err) = source.open(&sink).await {
            drop(source);
            drop(sink);
            uploader.shutdown().await;
            return Err(err.into());
        }

        let producer = self.supervise(session_id, source, sink, cancel.child_token());
        let sampler = StatsSampler::new(options.stats_interval).spawn(
            counters,
            self.inner.state.subscribe(),
            events.clone(),
            cancel.child_token(),
        );

        Ok(ActiveSession {
            handle: SessionHandle {
                session_id,
                viewer_url: config.viewer_url(),
                config,
            },
            events,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            uploader,
            producer,
            sampler,
        })
    }

    /// Run the producer and turn a fatal device error into a session failure.
    fn supervise(
        &self,
        session_id: Uuid,
        source: Box<dyn FrameProducer>,
        sink: FrameSink,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let controller: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let name = source.name().to_string();
            match source.run(sink, cancel.clone()).await {
                Ok(()) => debug!(%session_id, "Producer {} finished", name),
                Err(err) if cancel.is_cancelled() => {
                    warn!(%session_id, "Producer {} failed while stopping: {}", name, err);
                }
                Err(err) => {
                    error!(%session_id, "Producer {} failed: {}", name, err);
                    if let Some(inner) = controller.upgrade() {
                        let controller = StreamController { inner };
                        // Separate task: teardown awaits this one.
                        tokio::spawn(async move {
                            controller.fail(session_id, err.to_string()).await;
                        });
                    }
                }
            }
        })
    }

    async fn fail(&self, session_id: Uuid, reason: String) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match lifecycle.active.take() {
            Some(active) if active.handle.session_id == session_id => {
                self.teardown(&mut lifecycle, active, Some(reason)).await;
            }
            other => {
                lifecycle.active = other;
                warn!(%session_id, "Session already ended, not marking failed: {}", reason);
            }
        }
    }

    /// Stop the session identified by `handle`. Stopping a session that has
    /// already stopped or failed is a no-op.
    pub async fn stop(&self, handle: &SessionHandle) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        match lifecycle.active.take() {
            Some(active) if active.handle.session_id == handle.session_id => {
                self.teardown(&mut lifecycle, active, None).await;
                Ok(())
            }
            Some(active) => {
                lifecycle.active = Some(active);
                Err(StateError::SessionMismatch {
                    requested: handle.session_id,
                }
                .into())
            }
            None if lifecycle.finished == Some(handle.session_id) => {
                debug!(session_id = %handle.session_id, "Session already stopped");
                Ok(())
            }
            None => match self.state() {
                StreamingState::Idle => Err(StateError::NotStreaming.into()),
                _ => Err(StateError::SessionMismatch {
                    requested: handle.session_id,
                }
                .into()),
            },
        }
    }

    /// Stop whatever session is active.
    pub async fn shutdown(&self) -> Result<()> {
        match self.active_session().await {
            Some(handle) => self.stop(&handle).await,
            None => Ok(()),
        }
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle, active: ActiveSession, failure: Option<String>) {
        let session_id = active.handle.session_id;
        let events = active.events.clone();

        match &failure {
            None => {
                if self
                    .inner
                    .state
                    .transition(StreamingState::is_streaming, StreamingState::Stopping)
                    .is_ok()
                {
                    events.state_changed(StreamingState::Stopping).await;
                }
            }
            Some(reason) => {
                let failed = StreamingState::Failed(reason.clone());
                if self
                    .inner
                    .state
                    .transition(StreamingState::is_active, failed.clone())
                    .is_ok()
                {
                    events.state_changed(failed).await;
                }
                events.failed(reason.clone()).await;
            }
        }

        active.cancel.cancel();
        let stop_timeout = self.inner.options.producer_stop_timeout;
        let producer_abort = active.producer.abort_handle();
        match tokio::time::timeout(stop_timeout, active.producer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(%session_id, "Producer task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    %session_id,
                    "Capture did not stop within {:?}, releasing the device in the background",
                    stop_timeout
                );
                producer_abort.abort();
            }
        }
        let summary = active.uploader.shutdown().await;
        if let Err(e) = active.sampler.await {
            error!(%session_id, "Stats sampler ended abnormally: {}", e);
        }

        if failure.is_none()
            && self
                .inner
                .state
                .transition(|s| *s == StreamingState::Stopping, StreamingState::Stopped)
                .is_ok()
        {
            events.state_changed(StreamingState::Stopped).await;
        }

        lifecycle.finished = Some(session_id);
        lifecycle.last_summary = Some(summary);
        info!(
            %session_id,
            uploaded = summary.uploaded,
            dropped = summary.dropped_overflow,
            "Session ended ({})",
            self.state()
        );
    }
}
