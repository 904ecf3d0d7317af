use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid server host: {host:?}")]
    InvalidHost { host: String },

    #[error("Invalid server port: {port} (expected 1-65535)")]
    InvalidPort { port: u32 },

    #[error("Unknown stream mode: {value:?}")]
    UnknownMode { value: String },

    #[error("Unknown stream quality: {value:?}")]
    UnknownQuality { value: String },

    #[error("Settings file error: {message}")]
    Storage { message: String },

    #[error("Invalid setting {field}: {message}")]
    InvalidSetting { field: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
