use reqwest::StatusCode;
use thiserror::Error;

/// Every way a report can fail. None of these escape the caller-facing API;
/// the store logs them and moves on.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no Coverband API key was found")]
    MissingApiKey,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("unexpected status: {status} body={body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed response body: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to serialize payload: {0}")]
    Serialize(String),
    #[error("report did not finish within {0:?}")]
    TimedOut(std::time::Duration),
    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),
    #[error("report worker failed: {0}")]
    Join(String),
}

impl ReportError {
    /// Connection-level failures; the persistent transport reconnects and
    /// retries on these and nothing else.
    pub fn is_transport(&self) -> bool {
        matches!(self, ReportError::Transport(_))
    }
}

impl From<reqwest::Error> for ReportError {
    fn from(err: reqwest::Error) -> Self {
        ReportError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for ReportError {
    fn from(err: url::ParseError) -> Self {
        ReportError::InvalidConfig(format!("invalid url: {err}"))
    }
}

pub type ReportResult<T> = Result<T, ReportError>;
