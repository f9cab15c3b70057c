use thiserror::Error;

/// Reasons an inbound control-channel frame is not a usable client message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unexpected message type: {}", .0.as_deref().unwrap_or("<missing>"))]
    UnexpectedType(Option<String>),
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("path has no file name: {0}")]
    MissingFileName(String),
    #[error("file name is not valid UTF-8: {0}")]
    NonUtf8FileName(String),
    #[error("invalid server address: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
