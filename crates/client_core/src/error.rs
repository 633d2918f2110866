use shared::error::ApiException;
use thiserror::Error;

/// Failure of a single history or roster pull.
///
/// Pulls are never retried internally; the caller decides what to do.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page limit must be positive")]
    InvalidLimit,
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server rejected request with status {status}: {source}")]
    Rejected {
        status: u16,
        #[source]
        source: ApiException,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}
