use thiserror::Error;

/// Top-level error type for Relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Error from a messaging channel.
    #[error("channel error: {0}")]
    Channel(String),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(String),

    /// Sandbox spawn or stream error.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Filesystem IPC error.
    #[error("ipc error: {0}")]
    Ipc(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
