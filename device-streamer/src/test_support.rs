//! Device doubles shared by the controller and uploader tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use common::Frame;

use crate::capture::{AudioSettings, Camera, CaptureCallback, CaptureDevices, CaptureEvent, CaptureSettings, Microphone};
use crate::errors::{DeviceError, NetworkError};
use crate::events::StreamEvent;
use crate::synthetic::synthetic_jpeg;
use crate::transport::FrameTransport;

const TEST_FRAME_INTERVAL: Duration = Duration::from_millis(10);
const TEST_CHUNK: usize = 320;

/// How a test device behaves once opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    FailOnOpen,
    /// Deliver this many frames, then report a disconnect.
    FailAfter(usize),
    /// Every read blocks this long before returning a chunk.
    Stall(Duration),
}

/// Open/close bookkeeping for one kind of device.
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub delivered: AtomicUsize,
}

impl DeviceLog {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

pub struct TestCamera {
    behavior: Behavior,
    log: Arc<DeviceLog>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Camera for TestCamera {
    fn name(&self) -> &str {
        "test-camera"
    }

    fn start(&mut self, _settings: &CaptureSettings, callback: CaptureCallback) -> Result<(), DeviceError> {
        if self.behavior == Behavior::FailOnOpen {
            return Err(DeviceError::Unavailable {
                device: "test-camera".to_string(),
            });
        }
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let log = self.log.clone();
        let limit = match self.behavior {
            Behavior::FailAfter(n) => Some(n),
            _ => None,
        };
        self.thread = Some(std::thread::spawn(move || {
            let mut seq = 0u64;
            while running.load(Ordering::SeqCst) {
                if limit.is_some_and(|n| seq as usize >= n) {
                    callback(CaptureEvent::Error(DeviceError::Disconnected {
                        device: "test-camera".to_string(),
                    }));
                    break;
                }
                callback(CaptureEvent::Frame(synthetic_jpeg(seq, 256)));
                log.delivered.fetch_add(1, Ordering::SeqCst);
                seq += 1;
                std::thread::sleep(TEST_FRAME_INTERVAL);
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct TestMicrophone {
    behavior: Behavior,
    log: Arc<DeviceLog>,
    reads: usize,
    open: bool,
}

impl Microphone for TestMicrophone {
    fn name(&self) -> &str {
        "test-microphone"
    }

    fn open(&mut self, _settings: &AudioSettings) -> Result<(), DeviceError> {
        if self.behavior == Behavior::FailOnOpen {
            return Err(DeviceError::PermissionDenied {
                device: "test-microphone".to_string(),
            });
        }
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        self.open = true;
        Ok(())
    }

    fn chunk_size(&self) -> usize {
        TEST_CHUNK
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if let Behavior::FailAfter(n) = self.behavior {
            if self.reads >= n {
                return Err(DeviceError::ReadFailed {
                    device: "test-microphone".to_string(),
                    message: "stream ended".to_string(),
                });
            }
        }
        match self.behavior {
            Behavior::Stall(delay) => std::thread::sleep(delay),
            _ => std::thread::sleep(TEST_FRAME_INTERVAL),
        }
        let n = buf.len().min(TEST_CHUNK);
        buf[..n].fill(0x11);
        self.reads += 1;
        self.log.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(n)
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Hands out `TestCamera`/`TestMicrophone` instances that share one log per
/// device kind.
pub struct TestDevices {
    pub camera_behavior: Behavior,
    pub microphone_behavior: Behavior,
    pub camera_log: Arc<DeviceLog>,
    pub microphone_log: Arc<DeviceLog>,
}

impl TestDevices {
    pub fn new(camera_behavior: Behavior, microphone_behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            camera_behavior,
            microphone_behavior,
            camera_log: Arc::new(DeviceLog::default()),
            microphone_log: Arc::new(DeviceLog::default()),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(Behavior::Healthy, Behavior::Healthy)
    }
}

impl CaptureDevices for TestDevices {
    fn camera(&self) -> Box<dyn Camera> {
        Box::new(TestCamera {
            behavior: self.camera_behavior,
            log: self.camera_log.clone(),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    fn microphone(&self) -> Box<dyn Microphone> {
        Box::new(TestMicrophone {
            behavior: self.microphone_behavior,
            log: self.microphone_log.clone(),
            reads: 0,
            open: false,
        })
    }
}

/// In-memory transport with a scripted outcome.
pub struct FakeTransport {
    pub delay: Duration,
    pub outcome: Mutex<Box<dyn Fn() -> Result<(), NetworkError> + Send>>,
    pub sent: Mutex<Vec<Frame>>,
}

impl FakeTransport {
    pub fn succeeding(delay: Duration) -> Arc<Self> {
        Self::with_outcome(delay, || Ok(()))
    }

    pub fn with_outcome<F>(delay: Duration, outcome: F) -> Arc<Self>
    where
        F: Fn() -> Result<(), NetworkError> + Send + 'static,
    {
        Arc::new(Self {
            delay,
            outcome: Mutex::new(Box::new(outcome)),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FrameTransport for FakeTransport {
    async fn send(&self, frame: &Frame) -> Result<(), NetworkError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.outcome.lock().unwrap())();
        if result.is_ok() {
            self.sent.lock().unwrap().push(frame.clone());
        }
        result
    }
}

pub fn image_frame(size: usize) -> Frame {
    Frame::image(Bytes::from(vec![0xAB; size]))
}

/// Drain whatever events have been delivered so far.
pub fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
