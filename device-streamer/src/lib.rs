pub mod errors;
pub mod state;
pub mod events;
pub mod serde_helpers;
pub mod capture;
pub mod synthetic;
pub mod producer;
pub mod transport;
pub mod uploader;
pub mod stats;
pub mod controller;
pub mod config;
pub mod app;
pub mod mock_server;
#[cfg(test)]
mod test_support;

pub use common::{Frame, FrameKind, Mode, Quality, StatusSnapshot, StreamConfig};
pub use controller::{SessionHandle, SessionOptions, StreamController};
pub use errors::*;
pub use events::{ChannelEventHandler, EventHandler, LoggingEventHandler, StreamEvent};
pub use state::StreamingState;
