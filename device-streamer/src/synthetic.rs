use bytes::{BufMut, Bytes, BytesMut};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::capture::{
    AudioSettings, Camera, CaptureCallback, CaptureDevices, CaptureEvent, CaptureSettings, Microphone,
};
use crate::errors::DeviceError;

const MIN_FRAME_BYTES: usize = 64;
const AUDIO_CHUNK: Duration = Duration::from_millis(40);
const TONE_HZ: f64 = 440.0;
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Build a JPEG-shaped payload of `size` bytes: SOI, a JFIF APP0 header,
/// filler derived from `seq`, EOI.
pub fn synthetic_jpeg(seq: u64, size: usize) -> Bytes {
    const HEADER: [u8; 20] = [
        0xFF, 0xD8, // SOI
        0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
        0x00,
    ];
    let size = size.max(HEADER.len() + 2);
    let mut buf = BytesMut::with_capacity(size);
    buf.put_slice(&HEADER);
    let filler = size - HEADER.len() - 2;
    for i in 0..filler {
        // Keep 0xFF out of the scan data so the only markers are ours.
        buf.put_u8(((seq as usize + i) % 255) as u8);
    }
    buf.put_slice(&[0xFF, 0xD9]); // EOI
    buf.freeze()
}

/// Sleep until `deadline`, waking early if `running` is cleared.
fn sleep_until(deadline: Instant, running: &AtomicBool) {
    loop {
        let now = Instant::now();
        if now >= deadline || !running.load(Ordering::Acquire) {
            return;
        }
        thread::sleep((deadline - now).min(POLL_SLICE));
    }
}

/// Generates JPEG frames on its own thread at the configured frame rate,
/// sized so the stream roughly matches the quality's target bitrate.
pub struct SyntheticCamera {
    name: String,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Camera for SyntheticCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, settings: &CaptureSettings, callback: CaptureCallback) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::Capture {
                device: self.name.clone(),
                message: "capture already running".to_string(),
            });
        }

        let fps = settings.frame_rate.max(1);
        let interval = Duration::from_secs_f64(1.0 / fps as f64);
        let frame_bytes = ((settings.target_bitrate_bps / fps as u64 / 8) as usize).max(MIN_FRAME_BYTES);

        info!(
            "{}: {}x{} @ {} fps, {:?} profile, ~{} bytes/frame",
            self.name, settings.width, settings.height, fps, settings.profile, frame_bytes
        );

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let worker = thread::Builder::new()
            .name(format!("{}-capture", self.name))
            .spawn(move || {
                let mut seq = 0u64;
                let mut next = Instant::now();
                while running.load(Ordering::Acquire) {
                    callback(CaptureEvent::Frame(synthetic_jpeg(seq, frame_bytes)));
                    seq += 1;

                    next += interval;
                    let now = Instant::now();
                    if next < now {
                        // Fell behind; don't try to catch up with a burst.
                        next = now;
                    }
                    sleep_until(next, &running);
                }
                debug!("Capture thread exiting after {} frames", seq);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                DeviceError::Unavailable {
                    device: format!("{} ({})", self.name, e),
                }
            })?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            debug!("{} stopped", self.name);
        }
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Produces a continuous sine tone, one chunk per `read`, paced in real time.
pub struct SyntheticMicrophone {
    name: String,
    settings: Option<AudioSettings>,
    chunk_size: usize,
    phase: f64,
    next_chunk: Instant,
    running: AtomicBool,
}

impl SyntheticMicrophone {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: None,
            chunk_size: 0,
            phase: 0.0,
            next_chunk: Instant::now(),
            running: AtomicBool::new(false),
        }
    }
}

impl Microphone for SyntheticMicrophone {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, settings: &AudioSettings) -> Result<(), DeviceError> {
        let samples = (settings.sample_rate as u64 * AUDIO_CHUNK.as_millis() as u64 / 1000).max(1) as usize;
        self.chunk_size = samples * settings.channels.max(1) as usize * AudioSettings::BYTES_PER_SAMPLE;
        self.settings = Some(*settings);
        self.phase = 0.0;
        self.next_chunk = Instant::now();
        self.running.store(true, Ordering::Release);
        info!(
            "{}: {} Hz, {} channel(s), {} byte chunks",
            self.name, settings.sample_rate, settings.channels, self.chunk_size
        );
        Ok(())
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let settings = self.settings.ok_or_else(|| DeviceError::ReadFailed {
            device: self.name.clone(),
            message: "microphone is not open".to_string(),
        })?;

        sleep_until(self.next_chunk, &self.running);
        let now = Instant::now();
        self.next_chunk += AUDIO_CHUNK;
        if self.next_chunk < now {
            self.next_chunk = now;
        }

        let channels = settings.channels.max(1) as usize;
        let frame_bytes = channels * AudioSettings::BYTES_PER_SAMPLE;
        let len = self.chunk_size.min(buf.len()) / frame_bytes * frame_bytes;
        let step = 2.0 * PI * TONE_HZ / settings.sample_rate as f64;

        for frame in buf[..len].chunks_exact_mut(frame_bytes) {
            let sample = ((self.phase.sin() * 0.25) * i16::MAX as f64) as i16;
            for channel in frame.chunks_exact_mut(AudioSettings::BYTES_PER_SAMPLE) {
                channel.copy_from_slice(&sample.to_le_bytes());
            }
            self.phase = (self.phase + step) % (2.0 * PI);
        }

        Ok(len)
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if self.settings.take().is_some() {
            debug!("{} closed", self.name);
        }
    }
}

/// Device provider backed by the synthetic camera and microphone.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDevices;

impl CaptureDevices for SyntheticDevices {
    fn camera(&self) -> Box<dyn Camera> {
        Box::new(SyntheticCamera::new("synthetic-camera"))
    }

    fn microphone(&self) -> Box<dyn Microphone> {
        Box::new(SyntheticMicrophone::new("synthetic-microphone"))
    }
}
