use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("completion credential is not configured")]
    MissingCredential,

    #[error("completion request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("unexpected response format: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        if e.is_decode() {
            return Self::MalformedResponse(e.to_string());
        }
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}
