//! Error types.

use thiserror::Error;

/// Failure to turn a rule into a [`Response`](crate::response::Response).
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("invalid path pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid base64 body: {0}")]
    Body(#[from] base64::DecodeError),
    #[error("invalid return code: {0}")]
    Status(i64),
}

/// Failure while capturing a request.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("unable to read the request body: {0}")]
    Read(String),
    #[error("unable to write the captured request: {0}")]
    Write(#[from] std::io::Error),
    #[error("unable to serialize the captured request: {0}")]
    Serialize(#[from] serde_json::Error),
}
