use thiserror::Error;
use crate::errors::UpstreamError;
use crate::manager_store::errors::StoreError;
use crate::time_key::TimeKeyError;

#[derive(Debug, Error)]
pub enum DayAheadError {
    #[error("DocumentError: {0}")]
    DocumentError(String),
    #[error("UpstreamError: {0}")]
    UpstreamError(#[from] UpstreamError),
    #[error("TimestampError: {0}")]
    TimestampError(#[from] TimeKeyError),
    #[error("StoreError: {0}")]
    StoreError(#[from] StoreError),
    #[error("ClientError: {0}")]
    ClientError(String),
}

impl DayAheadError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DayAheadError::UpstreamError(UpstreamError::RateLimited))
    }
}

impl From<quick_xml::DeError> for DayAheadError {
    fn from(e: quick_xml::DeError) -> Self {
        DayAheadError::DocumentError(e.to_string())
    }
}
