//! Local stand-in for the ingest server.
//!
//! Accepts the same upload endpoints as the real receiver and records what it
//! saw, so integration tests and manual demos can run without one.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::protocol::{UPLOAD_AUDIO_PATH, UPLOAD_FRAME_PATH};
use common::FrameKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    pub frames: u64,
    pub frame_bytes: u64,
    pub audio_chunks: u64,
    pub audio_bytes: u64,
    /// Requests answered with a non-2xx status.
    pub rejected: u64,
    pub content_types: BTreeSet<String>,
    pub last_content_length: Option<u64>,
}

struct IngestState {
    stats: Mutex<IngestStats>,
    last_frame: Mutex<Option<Bytes>>,
    status: AtomicU16,
    delay_ms: AtomicU64,
}

impl IngestState {
    fn new() -> Self {
        Self {
            stats: Mutex::new(IngestStats::default()),
            last_frame: Mutex::new(None),
            status: AtomicU16::new(200),
            delay_ms: AtomicU64::new(0),
        }
    }

    async fn accept(&self, kind: FrameKind, headers: &HeaderMap, body: Bytes) -> StatusCode {
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let configured = StatusCode::from_u16(self.status.load(Ordering::Relaxed))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let status = if content_type != kind.content_type() {
            warn!("Rejecting {} upload with content type {:?}", kind, content_type);
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        } else {
            configured
        };

        let Ok(mut stats) = self.stats.lock() else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        stats.content_types.insert(content_type);
        stats.last_content_length = content_length;

        if !status.is_success() {
            stats.rejected += 1;
            return status;
        }

        match kind {
            FrameKind::Image => {
                stats.frames += 1;
                stats.frame_bytes += body.len() as u64;
                if let Ok(mut last) = self.last_frame.lock() {
                    *last = Some(body);
                }
            }
            FrameKind::Audio => {
                stats.audio_chunks += 1;
                stats.audio_bytes += body.len() as u64;
            }
        }
        status
    }
}

async fn upload_frame(State(state): State<Arc<IngestState>>, headers: HeaderMap, body: Bytes) -> StatusCode {
    state.accept(FrameKind::Image, &headers, body).await
}

async fn upload_audio(State(state): State<Arc<IngestState>>, headers: HeaderMap, body: Bytes) -> StatusCode {
    state.accept(FrameKind::Audio, &headers, body).await
}

async fn stats(State(state): State<Arc<IngestState>>) -> Json<IngestStats> {
    Json(state.stats.lock().map(|s| s.clone()).unwrap_or_default())
}

/// Latest JPEG, so `/img` can be opened in a browser.
async fn latest_image(State(state): State<Arc<IngestState>>) -> Response {
    let last = state.last_frame.lock().ok().and_then(|last| last.clone());
    match last {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn viewer(State(state): State<Arc<IngestState>>) -> String {
    let stats = state.stats.lock().map(|s| s.clone()).unwrap_or_default();
    format!(
        "mock ingest: {} frames ({} bytes), {} audio chunks ({} bytes)\n",
        stats.frames, stats.frame_bytes, stats.audio_chunks, stats.audio_bytes
    )
}

fn router(state: Arc<IngestState>) -> Router {
    Router::new()
        .route(UPLOAD_FRAME_PATH, post(upload_frame))
        .route(UPLOAD_AUDIO_PATH, post(upload_audio))
        .route("/img", get(latest_image))
        .route("/audio", get(viewer))
        .route("/video", get(viewer))
        .route("/stats", get(stats))
        .with_state(state)
}

pub struct MockIngestServer {
    addr: SocketAddr,
    state: Arc<IngestState>,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl MockIngestServer {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(IngestState::new());
        let shutdown = CancellationToken::new();

        let app = router(state.clone());
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        info!("Mock ingest server listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown,
            task,
        })
    }

    /// Bind an ephemeral port on loopback.
    pub async fn start_local() -> std::io::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stats(&self) -> IngestStats {
        self.state.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Answer every upload with `status` from now on.
    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::Relaxed);
    }

    /// Hold every upload for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.state.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Poll until `condition` holds or `timeout` passes.
    pub async fn wait_for<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&IngestStats) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(&self.stats()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        match self.task.await {
            Ok(Ok(())) => debug!("Mock ingest server stopped"),
            Ok(Err(e)) => warn!("Mock ingest server error: {}", e),
            Err(e) => warn!("Mock ingest server task failed: {}", e),
        }
    }
}
