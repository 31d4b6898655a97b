use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network failure, timeout or non-success status
    #[error("upstream request failed: {0}")]
    Transient(String),

    /// Body could not be decoded or lacks the comment list
    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TargetError {
    #[error("invalid target format: {0:?}")]
    InvalidFormat(String),

    #[error("cannot resolve target {input:?}: {reason}")]
    Unresolvable { input: String, reason: String },
}
