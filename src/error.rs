//! Error types for the ARI client.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type AriResult<T> = std::result::Result<T, AriError>;

/// Errors surfaced to callers of the ARI client.
///
/// Reachability failures during [`Ari::connect`](crate::Ari::connect) (DNS
/// lookup failure, connection refused, TLS failure) all surface as
/// [`HostIsNotReachable`](AriError::HostIsNotReachable) so callers have a
/// single condition to handle. Network failures during an operation call
/// surface as [`TransportError`](AriError::TransportError) instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AriError {
    /// The server could not be reached while loading its self-description.
    #[error("host is not reachable: {message}")]
    HostIsNotReachable {
        /// Underlying transport failure.
        message: String,
    },

    /// The server answered an operation with an HTTP error status.
    #[error("server error ({status}): {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// The server JSON's `message` field, or the HTTP reason phrase.
        message: String,
    },

    /// The transport failed mid-call after the client was connected.
    #[error("transport error: {message}")]
    TransportError {
        /// Underlying transport failure.
        message: String,
    },

    /// A self-description document was malformed or missing required keys.
    #[error("schema invalid: {message}")]
    SchemaInvalid {
        /// What was wrong with the document.
        message: String,
    },

    /// A required operation parameter was absent from the option map.
    #[error("missing required parameter: {name}")]
    MissingRequiredParameter {
        /// Declared parameter name.
        name: String,
    },

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// No resource namespace with this name exists in the loaded catalog.
    #[error("unknown resource: {name}")]
    UnknownResource {
        /// Requested namespace name.
        name: String,
    },

    /// The resource exists but has no operation with this name.
    #[error("unknown operation: {resource}.{operation}")]
    UnknownOperation {
        /// Resource namespace name.
        resource: String,
        /// Requested operation name.
        operation: String,
    },

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configured base URL could not be parsed.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl AriError {
    /// Transport failure mid-call.
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        AriError::TransportError {
            message: err.to_string(),
        }
    }

    /// Malformed self-description document.
    pub(crate) fn schema(message: impl Into<String>) -> Self {
        AriError::SchemaInvalid {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for AriError {
    fn from(err: reqwest::Error) -> Self {
        // Credentials travel in headers, never in the URL the message
        // may include.
        AriError::transport(err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AriError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AriError::transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let err = AriError::ServerError {
            status: 404,
            message: "Channel not found".to_string(),
        };
        assert_eq!(err.to_string(), "server error (404): Channel not found");

        let err = AriError::MissingRequiredParameter {
            name: "endpoint".to_string(),
        };
        assert_eq!(err.to_string(), "missing required parameter: endpoint");

        let err = AriError::UnknownOperation {
            resource: "channels".to_string(),
            operation: "frobnicate".to_string(),
        };
        assert_eq!(err.to_string(), "unknown operation: channels.frobnicate");
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(AriError::Cancelled.to_string(), "operation cancelled");
    }
}
