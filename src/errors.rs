use reqwest::StatusCode;
use thiserror::Error;

/// Longest part of a provider response body carried into an error message
const MAX_BODY_IN_ERROR: usize = 200;

/// Error depicting failures when talking to an external data provider
///
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("UpstreamUnavailable: {0}")]
    Unavailable(String),
    #[error("UpstreamRejected: {0}")]
    Rejected(String),
    #[error("RateLimited: provider refused further requests")]
    RateLimited,
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status == StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited,
            Some(status) if !status.is_server_error() => UpstreamError::Rejected(e.to_string()),
            _ => UpstreamError::Unavailable(e.to_string()),
        }
    }
}

/// Classifies a provider response status
///
/// # Arguments
///
/// * 'status' - HTTP status of the response
/// * 'body' - response body, used as the error message when the status is not a success
pub fn check_status(status: StatusCode, body: &str) -> Result<(), UpstreamError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Err(UpstreamError::RateLimited)
    } else if status.is_server_error() {
        Err(UpstreamError::Unavailable(format!("{}: {}", status, truncate(body))))
    } else {
        Err(UpstreamError::Rejected(format!("{}: {}", status, truncate(body))))
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_BODY_IN_ERROR) {
        Some((i, _)) => &body[..i],
        None => body,
    }
}
