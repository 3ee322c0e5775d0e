use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid sweep config: {0}")]
    InvalidConfig(String),

    #[error("unknown work variant: {0}")]
    UnknownVariant(String),

    #[error("worker protocol: {0}")]
    Protocol(String),

    #[error("failed to persist results to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
