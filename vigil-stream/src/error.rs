use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid source URL: {0}")]
    InvalidSource(String),

    #[error("Failed to spawn encoder: {0}")]
    Spawn(String),

    #[error("Encoder exited immediately (code {code:?})")]
    EncoderExited { code: Option<i32> },

    #[error("Snapshot capture failed: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
