use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The server rejected the bearer token; the session has been torn down.
    #[error("Session expired, please log in again")]
    Unauthorized,

    /// Login or signup was refused.
    #[error("{0}")]
    InvalidCredentials(String),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed server payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Caught before any request was sent.
    #[error("{0}")]
    Validation(String),

    /// The chat stream reported an error frame.
    #[error("{0}")]
    Stream(String),

    #[error("A reply is still streaming")]
    Busy,

    #[error("Local storage error: {0}")]
    Storage(String),
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized)
    }
}
