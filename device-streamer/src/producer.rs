use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::{Frame, Mode, Quality};

use crate::capture::{
    AudioSettings, Camera, CaptureCallback, CaptureDevices, CaptureEvent, CaptureSettings, Microphone,
};
use crate::errors::DeviceError;
use crate::events::SessionEvents;
use crate::uploader::FrameSink;

/// A capture source feeding frames into the upload queue.
#[async_trait]
pub trait FrameProducer: Send {
    fn name(&self) -> &str;

    /// Acquire the device(s) and begin capturing. An error here fails the
    /// session start.
    async fn open(&mut self, sink: &FrameSink) -> Result<(), DeviceError>;

    /// Produce until `cancel` fires or the device fails. Devices are released
    /// before this returns.
    async fn run(self: Box<Self>, sink: FrameSink, cancel: CancellationToken) -> Result<(), DeviceError>;
}

/// Per-session capture parameters shared by every producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSettings {
    pub capture: CaptureSettings,
    pub audio: AudioSettings,
}

impl ProducerSettings {
    pub fn new(mode: Mode, quality: Quality, frame_rate: u32, sample_rate: u32, hardware_acceleration: bool) -> Self {
        Self {
            capture: CaptureSettings::new(mode, quality, frame_rate, hardware_acceleration),
            audio: AudioSettings::mono(sample_rate),
        }
    }
}

/// Pick the producer(s) a mode needs.
pub fn for_mode(
    mode: Mode,
    devices: &dyn CaptureDevices,
    settings: &ProducerSettings,
    events: SessionEvents,
) -> Box<dyn FrameProducer> {
    let image = || ImageProducer::new(devices.camera(), settings.capture.clone());
    let audio = || AudioProducer::new(devices.microphone(), settings.audio);

    match (mode.captures_images(), mode.captures_audio()) {
        (true, true) => Box::new(AudioVideoProducer::new(image(), audio(), events)),
        (true, false) => Box::new(image()),
        (false, _) => Box::new(audio()),
    }
}

/// Push-based producer: the camera calls back on its own thread for every
/// captured JPEG.
pub struct ImageProducer {
    name: String,
    camera: Option<Box<dyn Camera>>,
    settings: CaptureSettings,
    errors: Option<mpsc::Receiver<DeviceError>>,
    started: bool,
}

impl ImageProducer {
    pub fn new(camera: Box<dyn Camera>, settings: CaptureSettings) -> Self {
        Self {
            name: camera.name().to_string(),
            camera: Some(camera),
            settings,
            errors: None,
            started: false,
        }
    }

    async fn release(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        if let Some(mut camera) = self.camera.take() {
            // Stopping joins the driver thread.
            if let Err(e) = tokio::task::spawn_blocking(move || camera.stop()).await {
                error!("Failed to stop camera: {}", e);
            }
        }
    }
}

#[async_trait]
impl FrameProducer for ImageProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, sink: &FrameSink) -> Result<(), DeviceError> {
        let camera = self.camera.as_mut().ok_or_else(|| DeviceError::Unavailable {
            device: self.name.clone(),
        })?;

        let (err_tx, err_rx) = mpsc::channel(4);
        let sink = sink.clone();
        let callback: CaptureCallback = Arc::new(move |event| match event {
            CaptureEvent::Frame(jpeg) => {
                sink.submit(Frame::image(jpeg));
            }
            CaptureEvent::Error(error) => {
                // Only the first error matters; the producer stops on it.
                let _ = err_tx.try_send(error);
            }
        });

        camera.start(&self.settings, callback)?;
        self.errors = Some(err_rx);
        self.started = true;
        info!("Camera {} started", self.name);
        Ok(())
    }

    async fn run(self: Box<Self>, _sink: FrameSink, cancel: CancellationToken) -> Result<(), DeviceError> {
        let mut this = self;
        let mut errors = this.errors.take().ok_or_else(|| DeviceError::Capture {
            device: this.name.clone(),
            message: "camera was not started".to_string(),
        })?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            Some(error) = errors.recv() => Err(error),
        };
        if let Err(e) = &outcome {
            warn!("Camera {} failed: {}", this.name, e);
        }

        this.release().await;
        debug!("Image producer {} finished", this.name);
        outcome
    }
}

impl Drop for ImageProducer {
    fn drop(&mut self) {
        if self.started {
            if let Some(mut camera) = self.camera.take() {
                camera.stop();
            }
        }
    }
}

/// Pull-based producer: a blocking read loop on the blocking thread pool.
pub struct AudioProducer {
    name: String,
    microphone: Option<Box<dyn Microphone>>,
    settings: AudioSettings,
    opened: bool,
}

impl AudioProducer {
    pub fn new(microphone: Box<dyn Microphone>, settings: AudioSettings) -> Self {
        Self {
            name: microphone.name().to_string(),
            microphone: Some(microphone),
            settings,
            opened: false,
        }
    }
}

#[async_trait]
impl FrameProducer for AudioProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, _sink: &FrameSink) -> Result<(), DeviceError> {
        let microphone = self.microphone.as_mut().ok_or_else(|| DeviceError::Unavailable {
            device: self.name.clone(),
        })?;
        microphone.open(&self.settings)?;
        self.opened = true;
        info!("Microphone {} opened", self.name);
        Ok(())
    }

    async fn run(self: Box<Self>, sink: FrameSink, cancel: CancellationToken) -> Result<(), DeviceError> {
        let mut this = self;
        let name = this.name.clone();
        let mut microphone = match (this.opened, this.microphone.take()) {
            (true, Some(microphone)) => microphone,
            _ => {
                return Err(DeviceError::ReadFailed {
                    device: name,
                    message: "microphone was not opened".to_string(),
                })
            }
        };
        this.opened = false;

        let task = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; microphone.chunk_size().max(1)];
            let mut chunks = 0u64;
            let result = loop {
                if cancel.is_cancelled() {
                    break Ok(());
                }
                match microphone.read(&mut buf) {
                    Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                    Ok(n) => {
                        sink.submit(Frame::audio(Bytes::copy_from_slice(&buf[..n])));
                        chunks += 1;
                    }
                    Err(e) => break Err(e),
                }
            };
            microphone.close();
            debug!("Audio loop finished after {} chunks", chunks);
            result
        });

        let result = task.await.map_err(|e| DeviceError::TaskFailed {
            device: name.clone(),
            message: e.to_string(),
        })?;
        if let Err(e) = &result {
            warn!("Microphone {} failed: {}", name, e);
        }
        result
    }
}

impl Drop for AudioProducer {
    fn drop(&mut self) {
        if self.opened {
            if let Some(mut microphone) = self.microphone.take() {
                microphone.close();
            }
        }
    }
}

/// Camera and microphone side by side. Losing one source is a warning; only
/// losing both fails the session.
pub struct AudioVideoProducer {
    image: Option<ImageProducer>,
    audio: Option<AudioProducer>,
    events: SessionEvents,
}

impl AudioVideoProducer {
    pub fn new(image: ImageProducer, audio: AudioProducer, events: SessionEvents) -> Self {
        Self {
            image: Some(image),
            audio: Some(audio),
            events,
        }
    }
}

async fn run_source<P: FrameProducer + 'static>(
    producer: Option<P>,
    sink: FrameSink,
    cancel: CancellationToken,
    events: SessionEvents,
) -> Option<Result<(), DeviceError>> {
    let producer = producer?;
    let name = producer.name().to_string();
    let result = Box::new(producer).run(sink, cancel.clone()).await;
    if let Err(e) = &result {
        if !cancel.is_cancelled() {
            events.warning(name, format!("source stopped: {}", e)).await;
        }
    }
    Some(result)
}

#[async_trait]
impl FrameProducer for AudioVideoProducer {
    fn name(&self) -> &str {
        "audio+video"
    }

    async fn open(&mut self, sink: &FrameSink) -> Result<(), DeviceError> {
        let mut reasons = Vec::new();

        if let Some(image) = self.image.as_mut() {
            if let Err(e) = image.open(sink).await {
                reasons.push(e.to_string());
                self.events
                    .warning(image.name().to_string(), format!("unavailable, continuing audio only: {}", e))
                    .await;
                self.image = None;
            }
        }
        if let Some(audio) = self.audio.as_mut() {
            if let Err(e) = audio.open(sink).await {
                reasons.push(e.to_string());
                self.events
                    .warning(audio.name().to_string(), format!("unavailable, continuing video only: {}", e))
                    .await;
                self.audio = None;
            }
        }

        if self.image.is_none() && self.audio.is_none() {
            return Err(DeviceError::AllSourcesFailed {
                reasons: reasons.join("; "),
            });
        }
        Ok(())
    }

    async fn run(self: Box<Self>, sink: FrameSink, cancel: CancellationToken) -> Result<(), DeviceError> {
        let mut this = self;
        let image = this.image.take();
        let audio = this.audio.take();

        let (video_result, audio_result) = tokio::join!(
            run_source(image, sink.clone(), cancel.clone(), this.events.clone()),
            run_source(audio, sink, cancel, this.events.clone()),
        );

        let mut reasons = Vec::new();
        let mut survived = false;
        for result in [video_result, audio_result].into_iter().flatten() {
            match result {
                Ok(()) => survived = true,
                Err(e) => reasons.push(e.to_string()),
            }
        }

        if survived {
            Ok(())
        } else {
            Err(DeviceError::AllSourcesFailed {
                reasons: reasons.join("; "),
            })
        }
    }
}
