use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::Frame;

use crate::events::SessionEvents;
use crate::stats::Counters;
use crate::transport::FrameTransport;

pub const MAX_WORKERS: usize = 16;

/// Tuning for the upload worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct UploaderConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Upper bound on payload bytes waiting in the queue.
    pub max_queued_bytes: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            max_queued_bytes: 2048 * 1024,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl UploaderConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    pub fn capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

/// Exponential backoff applied to the whole pool after repeated network
/// failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised, 0.0 disables jitter.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.multiplier.powi(attempt.min(30) as i32))
            .min(self.max_delay.as_millis() as f64);

        let jitter = delay_ms * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Raised when the pool crosses the failure threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Degraded {
    pub consecutive_failures: u32,
    pub retry_in: Duration,
}

/// Consecutive transport failures across all workers.
#[derive(Debug)]
pub struct FailureTracker {
    threshold: u32,
    window: Duration,
    policy: BackoffPolicy,
    streak: u32,
    streak_started: Option<Instant>,
    escalations: u32,
    backoff_until: Option<Instant>,
}

impl FailureTracker {
    pub fn new(threshold: u32, window: Duration, policy: BackoffPolicy) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            policy,
            streak: 0,
            streak_started: None,
            escalations: 0,
            backoff_until: None,
        }
    }

    /// A response came back; the connection works.
    pub fn record_success(&mut self) {
        self.streak = 0;
        self.streak_started = None;
        self.escalations = 0;
        self.backoff_until = None;
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<Degraded> {
        let expired = self
            .streak_started
            .map_or(true, |started| now.duration_since(started) > self.window);
        if expired {
            self.streak = 0;
            self.streak_started = Some(now);
        }

        self.streak += 1;
        if self.streak < self.threshold {
            return None;
        }

        let retry_in = self.policy.delay(self.escalations);
        let consecutive_failures = self.streak;
        self.escalations = self.escalations.saturating_add(1);
        self.backoff_until = Some(now + retry_in);
        self.streak = 0;
        self.streak_started = None;

        Some(Degraded {
            consecutive_failures,
            retry_in,
        })
    }

    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }
}

/// Cumulative per-session upload counters. Never decrease.
#[derive(Debug, Default)]
pub struct UploadMetrics {
    submitted: AtomicU64,
    uploaded: AtomicU64,
    dropped_overflow: AtomicU64,
    rejected_closed: AtomicU64,
    discarded_on_shutdown: AtomicU64,
    http_errors: AtomicU64,
    network_errors: AtomicU64,
}

impl UploadMetrics {
    pub fn snapshot(&self) -> UploadSummary {
        UploadSummary {
            submitted: self.submitted.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            rejected_closed: self.rejected_closed.load(Ordering::Relaxed),
            discarded_on_shutdown: self.discarded_on_shutdown.load(Ordering::Relaxed),
            http_errors: self.http_errors.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub submitted: u64,
    pub uploaded: u64,
    pub dropped_overflow: u64,
    pub rejected_closed: u64,
    pub discarded_on_shutdown: u64,
    pub http_errors: u64,
    pub network_errors: u64,
}

/// Result of handing a frame to the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue full; the new frame was discarded.
    Dropped,
    /// The uploader is shutting down.
    Closed,
}

struct Shared {
    accepting: AtomicBool,
    queued_bytes: AtomicUsize,
    max_queued_bytes: usize,
    metrics: UploadMetrics,
    counters: Arc<Counters>,
    failures: Mutex<FailureTracker>,
    events: SessionEvents,
    auto_reconnect: bool,
}

/// Producer-side handle to the upload queue.
///
/// `submit` never blocks and never awaits, so it is safe to call from a
/// camera driver thread or a blocking audio loop.
#[derive(Clone)]
pub struct FrameSink {
    queue: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
}

impl FrameSink {
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::Acquire) {
            shared.metrics.rejected_closed.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Closed;
        }
        shared.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        let len = frame.len();
        let queued = shared.queued_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if queued > shared.max_queued_bytes && queued != len {
            shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            self.record_drop("byte budget exhausted");
            return SubmitOutcome::Dropped;
        }

        match self.queue.try_send(frame) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
                self.record_drop("queue full");
                SubmitOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
                shared.metrics.rejected_closed.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Closed
            }
        }
    }

    fn record_drop(&self, cause: &str) {
        let dropped = self.shared.metrics.dropped_overflow.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % 100 == 0 {
            warn!("Upload {}, dropping newest frames ({} dropped so far)", cause, dropped);
        }
    }

    pub fn metrics(&self) -> UploadSummary {
        self.shared.metrics.snapshot()
    }
}

/// Bounded queue drained by a fixed pool of HTTP upload workers.
pub struct Uploader {
    sink: FrameSink,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl Uploader {
    pub fn start(
        config: &UploaderConfig,
        transport: Arc<dyn FrameTransport>,
        counters: Arc<Counters>,
        events: SessionEvents,
        auto_reconnect: bool,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity());
        let receiver = Arc::new(tokio::sync::Mutex::new(rx));

        let shared = Arc::new(Shared {
            accepting: AtomicBool::new(true),
            queued_bytes: AtomicUsize::new(0),
            max_queued_bytes: config.max_queued_bytes.max(1),
            metrics: UploadMetrics::default(),
            counters,
            failures: Mutex::new(FailureTracker::new(
                config.failure_threshold,
                config.failure_window,
                config.backoff.clone(),
            )),
            events,
            auto_reconnect,
        });

        let worker_count = config.worker_count();
        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    shared.clone(),
                    receiver.clone(),
                    transport.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        info!(
            "Uploader started: {} workers, queue capacity {}",
            worker_count,
            config.capacity()
        );

        Self {
            sink: FrameSink {
                queue: tx,
                shared: shared.clone(),
            },
            shared,
            receiver,
            workers,
            cancel,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    pub fn metrics(&self) -> UploadSummary {
        self.shared.metrics.snapshot()
    }

    /// Stop accepting frames, let in-flight uploads finish, and discard
    /// whatever is still queued.
    pub async fn shutdown(mut self) -> UploadSummary {
        self.shared.accepting.store(false, Ordering::Release);
        self.cancel.cancel();

        let workers = std::mem::take(&mut self.workers);
        let abort_handles: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();

        if tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!(
                "Upload workers did not finish within {:?}, aborting",
                self.shutdown_timeout
            );
            for handle in abort_handles {
                handle.abort();
            }
        }

        let mut rx = self.receiver.lock().await;
        rx.close();
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.shared.queued_bytes.store(0, Ordering::Release);
        self.shared
            .metrics
            .discarded_on_shutdown
            .fetch_add(discarded, Ordering::Relaxed);

        let summary = self.shared.metrics.snapshot();
        info!(
            submitted = summary.submitted,
            uploaded = summary.uploaded,
            dropped = summary.dropped_overflow,
            discarded = summary.discarded_on_shutdown,
            "Uploader stopped"
        );
        summary
    }
}

async fn worker_loop(
    id: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
    transport: Arc<dyn FrameTransport>,
    cancel: CancellationToken,
) {
    debug!("Upload worker {} started", id);

    loop {
        let backoff = shared
            .failures
            .lock()
            .ok()
            .and_then(|tracker| tracker.backoff_remaining(Instant::now()));
        if let Some(wait) = backoff {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => continue,
            }
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            frame = async { receiver.lock().await.recv().await } => frame,
        };
        let Some(frame) = next else { break };
        shared.queued_bytes.fetch_sub(frame.len(), Ordering::AcqRel);

        upload_one(&shared, transport.as_ref(), frame).await;
    }

    debug!("Upload worker {} exiting", id);
}

async fn upload_one(shared: &Shared, transport: &dyn FrameTransport, frame: Frame) {
    match transport.send(&frame).await {
        Ok(()) => {
            shared.metrics.uploaded.fetch_add(1, Ordering::Relaxed);
            shared.counters.record(frame.len());
            if let Ok(mut tracker) = shared.failures.lock() {
                tracker.record_success();
            }
        }
        Err(error) if !error.is_transport_failure() => {
            shared.metrics.http_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping {} frame: {}", frame.kind, error);
            if let Ok(mut tracker) = shared.failures.lock() {
                tracker.record_success();
            }
        }
        Err(error) => {
            shared.metrics.network_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping {} frame: {}", frame.kind, error);

            let degraded = shared
                .failures
                .lock()
                .ok()
                .and_then(|mut tracker| tracker.record_failure(Instant::now()));
            if let Some(degraded) = degraded {
                warn!(
                    "{} consecutive upload failures, pausing uploads for {:?}",
                    degraded.consecutive_failures, degraded.retry_in
                );
                shared
                    .events
                    .connection_degraded(degraded.consecutive_failures, degraded.retry_in, shared.auto_reconnect)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter_factor: 0.0,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(40), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(450) && delay <= Duration::from_millis(550));
        }
    }

    #[test]
    fn test_third_failure_degrades_once() {
        let mut tracker = FailureTracker::new(3, Duration::from_secs(10), no_jitter());
        let now = Instant::now();

        assert_eq!(tracker.record_failure(now), None);
        assert_eq!(tracker.record_failure(now + Duration::from_secs(1)), None);
        let degraded = tracker.record_failure(now + Duration::from_secs(2)).unwrap();
        assert_eq!(degraded.consecutive_failures, 3);
        assert_eq!(degraded.retry_in, Duration::from_millis(500));

        // The streak restarts after a warning.
        assert_eq!(tracker.record_failure(now + Duration::from_secs(3)), None);
        assert!(tracker.backoff_remaining(now + Duration::from_secs(2)).is_some());
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let mut tracker = FailureTracker::new(3, Duration::from_secs(10), no_jitter());
        let now = Instant::now();

        tracker.record_failure(now);
        tracker.record_failure(now + Duration::from_secs(1));
        assert_eq!(tracker.record_failure(now + Duration::from_secs(12)), None);
    }

    #[test]
    fn test_success_resets_streak_and_backoff() {
        let mut tracker = FailureTracker::new(3, Duration::from_secs(10), no_jitter());
        let now = Instant::now();

        for _ in 0..3 {
            tracker.record_failure(now);
        }
        assert!(tracker.backoff_remaining(now).is_some());

        tracker.record_success();
        assert!(tracker.backoff_remaining(now).is_none());
        assert_eq!(tracker.record_failure(now), None);
        assert_eq!(tracker.record_failure(now), None);
        // Escalation was reset, so the next warning starts from the base delay.
        assert_eq!(tracker.record_failure(now).unwrap().retry_in, Duration::from_millis(500));
    }

    #[test]
    fn test_worker_count_clamped() {
        let mut config = UploaderConfig::default();
        config.workers = 0;
        assert_eq!(config.worker_count(), 1);
        config.workers = 64;
        assert_eq!(config.worker_count(), MAX_WORKERS);
    }
}
