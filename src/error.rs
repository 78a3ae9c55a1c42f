use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing API credential: {0}")]
    MissingCredential(&'static str),

    #[error("Unknown price key: {0}")]
    UnknownKey(String),

    // Quota errors
    #[error("Rate limit quota exhausted for upstream {0}")]
    QuotaExceeded(&'static str),

    // Upstream errors
    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Upstream {upstream} returned HTTP {status}")]
    UpstreamStatus { upstream: &'static str, status: u16 },

    #[error("Malformed payload from {upstream}: {detail}")]
    MalformedPayload {
        upstream: &'static str,
        detail: String,
    },

    // System errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient upstream failures are retried under backoff. Configuration
    /// and quota errors fail the call immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::UpstreamStatus { .. } | Error::MalformedPayload { .. }
        )
    }
}
