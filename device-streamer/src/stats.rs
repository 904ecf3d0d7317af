use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::StatusSnapshot;

use crate::events::SessionEvents;
use crate::state::StreamingState;

/// Frames and bytes successfully delivered since the last sample.
///
/// Written by every upload worker, drained by the sampler with `swap(0)` so a
/// tick never loses or double-counts an increment.
#[derive(Debug, Default)]
pub struct Counters {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Read and reset both counters.
    pub fn take(&self) -> (u64, u64) {
        let frames = self.frames.swap(0, Ordering::AcqRel);
        let bytes = self.bytes.swap(0, Ordering::AcqRel);
        (frames, bytes)
    }
}

/// Periodically converts `Counters` into `Status` events.
pub struct StatsSampler {
    interval: Duration,
}

impl StatsSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// Run until `cancel` fires or the session leaves `Starting`/`Streaming`.
    /// Always publishes one final `StatusSnapshot::STOPPED` before returning.
    pub fn spawn(
        self,
        counters: Arc<Counters>,
        state: watch::Receiver<StreamingState>,
        events: SessionEvents,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(counters, state, events, cancel))
    }

    async fn run(
        self,
        counters: Arc<Counters>,
        mut state: watch::Receiver<StreamingState>,
        events: SessionEvents,
        cancel: CancellationToken,
    ) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = state.borrow_and_update().clone();
                    if !matches!(current, StreamingState::Starting | StreamingState::Streaming) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last);
                    last = now;
                    let (frames, bytes) = counters.take();

                    // Counters keep accumulating during Starting; only report
                    // while actually streaming.
                    if state.borrow().is_streaming() {
                        let snapshot = StatusSnapshot::from_counts(frames, bytes, elapsed);
                        debug!("Sampled {} frames / {} bytes over {:?}", frames, bytes, elapsed);
                        events.status(snapshot).await;
                    }
                }
            }
        }

        events.status(StatusSnapshot::STOPPED).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelEventHandler, EventBus, StreamEvent};
    use crate::state::StateMachine;
    use uuid::Uuid;

    #[test]
    fn test_take_resets_counters() {
        let counters = Counters::new();
        counters.record(1000);
        counters.record(500);
        assert_eq!(counters.take(), (2, 1500));
        assert_eq!(counters.take(), (0, 0));
    }

    async fn sampler_fixture() -> (
        StateMachine,
        Arc<Counters>,
        SessionEvents,
        tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let bus = EventBus::new();
        let (handler, rx) = ChannelEventHandler::new();
        bus.add_handler(Arc::new(handler)).await;
        (
            StateMachine::new(),
            Arc::new(Counters::new()),
            bus.for_session(Uuid::new_v4()),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_reports_rates_and_final_snapshot() {
        let (machine, counters, events, mut rx) = sampler_fixture().await;
        machine.transition(|_| true, StreamingState::Streaming).unwrap();

        let cancel = CancellationToken::new();
        let handle = StatsSampler::new(Duration::from_secs(1)).spawn(
            counters.clone(),
            machine.subscribe(),
            events,
            cancel.clone(),
        );

        for _ in 0..30 {
            counters.record(125_000 / 30);
        }
        time::sleep(Duration::from_millis(1001)).await;

        match rx.recv().await.unwrap() {
            StreamEvent::Status { snapshot, .. } => {
                assert!(snapshot.is_streaming);
                assert!((snapshot.fps - 30.0).abs() < 0.1, "fps {}", snapshot.fps);
                assert!(snapshot.bitrate_bps > 990_000 && snapshot.bitrate_bps <= 1_000_000);
            }
            other => panic!("unexpected event {:?}", other),
        }

        cancel.cancel();
        handle.await.unwrap();

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        match last {
            Some(StreamEvent::Status { snapshot, .. }) => assert_eq!(snapshot, StatusSnapshot::STOPPED),
            other => panic!("expected final stopped snapshot, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_exits_when_state_leaves_streaming() {
        let (machine, counters, events, mut rx) = sampler_fixture().await;
        machine.transition(|_| true, StreamingState::Streaming).unwrap();

        let handle = StatsSampler::new(Duration::from_secs(1)).spawn(
            counters,
            machine.subscribe(),
            events,
            CancellationToken::new(),
        );
        tokio::task::yield_now().await;

        machine.transition(|_| true, StreamingState::Stopping).unwrap();
        handle.await.unwrap();

        match rx.recv().await.unwrap() {
            StreamEvent::Status { snapshot, .. } => assert_eq!(snapshot, StatusSnapshot::STOPPED),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_silent_while_starting() {
        let (machine, counters, events, mut rx) = sampler_fixture().await;
        machine.transition(|_| true, StreamingState::Starting).unwrap();

        let cancel = CancellationToken::new();
        let handle = StatsSampler::new(Duration::from_millis(100)).spawn(
            counters.clone(),
            machine.subscribe(),
            events,
            cancel.clone(),
        );
        counters.record(10);
        time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Only the final snapshot.
        match rx.recv().await.unwrap() {
            StreamEvent::Status { snapshot, .. } => assert_eq!(snapshot, StatusSnapshot::STOPPED),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
