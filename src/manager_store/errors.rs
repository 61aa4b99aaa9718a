use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
    #[error("SnapshotError: {0}")]
    SnapshotError(#[from] serde_json::Error),
}
