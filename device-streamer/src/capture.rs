use bytes::Bytes;
use std::sync::Arc;

use common::{Mode, Quality};

use crate::errors::DeviceError;

/// How the camera should be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureProfile {
    /// Independent full-resolution stills.
    Stills,
    /// Preview-stream capture for video modes. Frames are still delivered as
    /// individual JPEGs; no inter-frame encoding happens on the device.
    Continuous,
}

impl CaptureProfile {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::ImageOnly => CaptureProfile::Stills,
            _ => CaptureProfile::Continuous,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub target_bitrate_bps: u64,
    pub hardware_acceleration: bool,
    pub profile: CaptureProfile,
}

impl CaptureSettings {
    pub fn new(mode: Mode, quality: Quality, frame_rate: u32, hardware_acceleration: bool) -> Self {
        Self {
            width: quality.width(),
            height: quality.height(),
            frame_rate: frame_rate.max(1),
            target_bitrate_bps: quality.target_bitrate_bps(),
            hardware_acceleration,
            profile: CaptureProfile::for_mode(mode),
        }
    }
}

/// 16-bit little-endian mono PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSettings {
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: 1,
        }
    }
}

pub enum CaptureEvent {
    /// One encoded JPEG image.
    Frame(Bytes),
    Error(DeviceError),
}

/// Invoked on the camera's own thread. Must not block.
pub type CaptureCallback = Arc<dyn Fn(CaptureEvent) + Send + Sync>;

/// A push-based image source.
pub trait Camera: Send {
    fn name(&self) -> &str;

    /// Open the device and begin delivering frames to `callback`.
    fn start(&mut self, settings: &CaptureSettings, callback: CaptureCallback) -> Result<(), DeviceError>;

    /// Stop capture and release the device. After this returns the callback
    /// is never invoked again.
    fn stop(&mut self);
}

/// A pull-based PCM source.
pub trait Microphone: Send {
    fn name(&self) -> &str;

    fn open(&mut self, settings: &AudioSettings) -> Result<(), DeviceError>;

    /// Bytes returned by one `read` call.
    fn chunk_size(&self) -> usize;

    /// Block until one chunk is available and copy it into `buf`.
    ///
    /// Must return at the device's chunk cadence. Stopping a session only
    /// waits a bounded time for a read in progress; a read that overruns it
    /// keeps the device until it returns, after which it is closed.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    fn close(&mut self);
}

/// Hands out fresh device instances for every session.
pub trait CaptureDevices: Send + Sync {
    fn camera(&self) -> Box<dyn Camera>;
    fn microphone(&self) -> Box<dyn Microphone>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_follows_mode() {
        assert_eq!(CaptureProfile::for_mode(Mode::ImageOnly), CaptureProfile::Stills);
        assert_eq!(CaptureProfile::for_mode(Mode::VideoOnly), CaptureProfile::Continuous);
        assert_eq!(CaptureProfile::for_mode(Mode::AudioVideo), CaptureProfile::Continuous);
    }

    #[test]
    fn test_settings_from_quality() {
        let settings = CaptureSettings::new(Mode::VideoOnly, Quality::High1080p, 0, true);
        assert_eq!((settings.width, settings.height), (1920, 1080));
        assert_eq!(settings.frame_rate, 1);
        assert_eq!(settings.target_bitrate_bps, 5_000_000);
    }
}
