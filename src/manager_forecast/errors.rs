use thiserror::Error;
use crate::errors::UpstreamError;
use crate::manager_store::errors::StoreError;
use crate::time_key::TimeKeyError;

#[derive(Debug, Error)]
pub enum SolarForecastError {
    #[error("UnrecognizedForecastFormat: {0}")]
    UnrecognizedForecastFormat(String),
    #[error("UpstreamError: {0}")]
    UpstreamError(#[from] UpstreamError),
    #[error("TimestampError: {0}")]
    TimestampError(#[from] TimeKeyError),
    #[error("StoreError: {0}")]
    StoreError(#[from] StoreError),
    #[error("ClientError: {0}")]
    ClientError(String),
}

impl SolarForecastError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SolarForecastError::UpstreamError(UpstreamError::RateLimited))
    }
}
