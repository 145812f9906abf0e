use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Claim storage error: {0}")]
    Storage(String),

    #[error("Operator directory error: {0}")]
    Directory(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
