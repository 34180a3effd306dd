use thiserror::Error;

use varsync_core::ConfigError;

/// Errors that end a connection or stop the daemon.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
