use thiserror::Error;
use std::time::Duration;

pub use common::ConfigError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Capture device unavailable: {device}")]
    Unavailable { device: String },

    #[error("Permission denied for {device}")]
    PermissionDenied { device: String },

    #[error("Capture device disconnected: {device}")]
    Disconnected { device: String },

    #[error("Failed to read from {device}: {message}")]
    ReadFailed { device: String, message: String },

    #[error("Capture device error on {device}: {message}")]
    Capture { device: String, message: String },

    #[error("All capture sources failed: {reasons}")]
    AllSourcesFailed { reasons: String },

    #[error("Producer task for {device} ended abnormally: {message}")]
    TaskFailed { device: String, message: String },
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection to {url} failed: {message}")]
    ConnectFailed { url: String, message: String },

    #[error("Request to {url} timed out after {duration:?}")]
    Timeout { url: String, duration: Duration },

    #[error("Request to {url} failed: {message}")]
    RequestFailed { url: String, message: String },

    #[error("Server answered {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to build HTTP client: {message}")]
    ClientBuild { message: String },

    #[error("Server {address} unreachable: {message}")]
    Unreachable { address: String, message: String },
}

impl NetworkError {
    /// Transport-level failures count towards the degraded-connection streak;
    /// a server that answered, even with an error status, does not.
    pub fn is_transport_failure(&self) -> bool {
        !matches!(self, NetworkError::HttpStatus { .. })
    }

    pub fn from_reqwest(url: &str, timeout: Duration, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            NetworkError::Timeout {
                url: url.to_string(),
                duration: timeout,
            }
        } else if error.is_connect() {
            NetworkError::ConnectFailed {
                url: url.to_string(),
                message: error.to_string(),
            }
        } else {
            NetworkError::RequestFailed {
                url: url.to_string(),
                message: error.to_string(),
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("A streaming session is already active ({state})")]
    AlreadyStreaming { state: String },

    #[error("No streaming session is active")]
    NotStreaming,

    #[error("Session {requested} is not the active session")]
    SessionMismatch { requested: uuid::Uuid },
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    /// The session ended on its own with a fatal error.
    #[error("Streaming session failed: {reason}")]
    SessionFailed { reason: String },
}

impl StreamError {
    pub fn is_already_streaming(&self) -> bool {
        matches!(self, StreamError::State(StateError::AlreadyStreaming { .. }))
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
