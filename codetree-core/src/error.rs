use codetree_scanner::ScanError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Ledger error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Startup failures that should end the process with a non-zero status.
    pub fn is_fatal(&self) -> bool {
        match self {
            CoreError::Scan(e) => e.is_fatal(),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
