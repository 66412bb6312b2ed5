//! Error types for spectrum-sync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Node error: {0}")]
    Node(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Chain reorganization at height {height}: {message}")]
    Reorg { height: u64, message: String },

    #[error("Block processing error at height {height}: {message}")]
    BlockProcessing { height: u64, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
