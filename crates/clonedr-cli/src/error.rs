//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] clonedr_common::Error),

    #[error("telemetry error: {0}")]
    Telemetry(#[from] clonedr_common::telemetry::TelemetryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration file {path}: {message}")]
    InvalidConfig { path: String, message: String },
}

impl Error {
    pub fn invalid_config(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            path: path.into(),
            message: message.into(),
        }
    }
}
