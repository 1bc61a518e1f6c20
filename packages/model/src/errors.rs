//! Error types for the document model

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Undo/redo replay error: {0}")]
    UndoReplay(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Failure reported by the document binding while reconciling the
/// in-memory tree with the persisted form. A `SyncError` moves the
/// model to [`crate::ModelState::NotWellFormed`].
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persisted form is not well-formed: {0}")]
    Malformed(String),
}
