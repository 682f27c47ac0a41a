use pixfetch_engine::FetchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Image not in cache: {0}")]
    NotCached(String),

    #[error("{failed} of {total} images failed")]
    Failed { failed: usize, total: usize },
}
