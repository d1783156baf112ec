use std::io;

use stride_core::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] stride_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Workout name cannot be empty")]
    EmptyName,
    #[error("Invalid exercise '{0}': expected NAME or NAME:SECONDS")]
    InvalidExercise(String),
    #[error("Could not resolve a data directory; pass --db-path or set STRIDE_DB_PATH")]
    NoDataDir,
    #[error("Peer database must differ from the local database")]
    SamePeer,
    #[error("Logging setup failed: {0}")]
    Logging(String),
}
