//! HTTP surface shared by the streaming device and the ingest server.

use crate::types::FrameKind;

/// Endpoint receiving JPEG frames.
pub const UPLOAD_FRAME_PATH: &str = "/upload_frame";

/// Endpoint receiving raw PCM chunks.
pub const UPLOAD_AUDIO_PATH: &str = "/upload_audio";

pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";
pub const CONTENT_TYPE_PCM: &str = "audio/pcm";

pub fn upload_path(kind: FrameKind) -> &'static str {
    match kind {
        FrameKind::Image => UPLOAD_FRAME_PATH,
        FrameKind::Audio => UPLOAD_AUDIO_PATH,
    }
}

/// Page a viewer opens on the server; published, never called by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerEndpoint {
    Image,
    Audio,
    Video,
}

impl ViewerEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            ViewerEndpoint::Image => "img",
            ViewerEndpoint::Audio => "audio",
            ViewerEndpoint::Video => "video",
        }
    }
}
