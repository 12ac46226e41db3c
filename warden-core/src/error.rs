use thiserror::Error;

pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("{0}")]
    Validation(String),

    #[error("platform query failed: {0}")]
    Platform(String),

    #[error("packet capture error: {0}")]
    Capture(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
