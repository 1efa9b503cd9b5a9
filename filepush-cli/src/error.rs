use std::path::PathBuf;

use filepush::{PumpError, PumpEvent};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pump error: {0}")]
    Pump(#[from] PumpError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("transfer ended with {event} at byte {position}")]
    Transfer { event: PumpEvent, position: u64 },
}

pub type Result<T> = std::result::Result<T, AppError>;
