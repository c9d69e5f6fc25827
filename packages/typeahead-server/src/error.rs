//! Error types for the typeahead server

use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Error, Debug)]
pub enum SearchError {
    /// Inbound frame is not a valid event envelope. Fatal for the connection.
    #[error("Malformed event: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Unknown event trigger: '{0}'")]
    UnknownTrigger(String),

    #[error("Bad payload in request: {0}")]
    BadPayload(String),

    #[error("Socket error: {0}")]
    Socket(#[from] tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl SearchError {
    /// Get error code for logs and inline error fragments
    pub fn code(&self) -> &'static str {
        match self {
            SearchError::Protocol(_) => "PROTOCOL_ERROR",
            SearchError::UnknownTrigger(_) => "UNKNOWN_TRIGGER",
            SearchError::BadPayload(_) => "BAD_PAYLOAD",
            SearchError::Socket(_) => "SOCKET_ERROR",
            SearchError::ConnectionClosed => "CONNECTION_CLOSED",
            SearchError::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error ends the connection it occurred on.
    ///
    /// Routing errors are reported back to the client inline and the
    /// connection stays open; everything else tears it down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SearchError::UnknownTrigger(_) | SearchError::BadPayload(_))
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_routing_errors_are_not_fatal() {
        assert!(!SearchError::UnknownTrigger("dance".into()).is_fatal());
        assert!(!SearchError::BadPayload("missing field".into()).is_fatal());
        assert!(SearchError::ConnectionClosed.is_fatal());
    }

    #[test]
    fn test_protocol_error_from_json() {
        let err: SearchError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SearchError::UnknownTrigger("dance".into());
        assert_eq!(err.to_string(), "Unknown event trigger: 'dance'");
    }
}
