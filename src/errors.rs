//! Error types for the ingestion client

use std::fmt;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug)]
pub enum ClientError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP request failed before a response was received
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// The service answered with a non-2xx status
    Api { status: u16, message: String },

    /// A batch could not be encoded for ingestion
    Encode(String),

    /// A flush pass failed and its records were dropped
    Flush {
        records: usize,
        source: Box<ClientError>,
    },

    /// Edge endpoints only accept API tokens
    PersonalTokenNotSupportedForEdge,

    /// The handler has already been shut down
    HandlerClosed,

    /// Generic error with message
    Other(String),
}

impl ClientError {
    /// HTTP status carried by this error, if the service produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(err) => err.status().map(|s| s.as_u16()),
            ClientError::Flush { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "IO error: {}", err),
            ClientError::Http(err) => write!(f, "HTTP error: {}", err),
            ClientError::Json(err) => write!(f, "JSON error: {}", err),
            ClientError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ClientError::Api { status, message } => {
                write!(f, "API error (status {}): {}", status, message)
            }
            ClientError::Encode(msg) => write!(f, "Encoding error: {}", msg),
            ClientError::Flush { records, source } => {
                write!(f, "Flush of {} records failed: {}", records, source)
            }
            ClientError::PersonalTokenNotSupportedForEdge => write!(
                f,
                "Personal tokens (xapt-) are not supported for edge endpoints, \
                 use an API token (xaat-)"
            ),
            ClientError::HandlerClosed => write!(f, "Handler is closed"),
            ClientError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(err) => Some(err),
            ClientError::Http(err) => Some(err),
            ClientError::Json(err) => Some(err),
            ClientError::Flush { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Http(err)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Json(err)
    }
}
