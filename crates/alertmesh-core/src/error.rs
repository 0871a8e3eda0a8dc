//! Error types for the alertmesh-core crate.

use thiserror::Error;

/// Errors that can occur in the alerting core.
#[derive(Debug, Error)]
pub enum AlertError {
    /// An alert in an ingest batch failed validation.
    #[error("invalid alert: {reason}")]
    InvalidAlert {
        /// The reason the alert is invalid.
        reason: String,
    },

    /// A label matcher could not be parsed or compiled.
    #[error("invalid matcher '{matcher}': {reason}")]
    InvalidMatcher {
        /// The offending matcher text.
        matcher: String,
        /// The reason the matcher is invalid.
        reason: String,
    },

    /// The routing tree configuration is invalid.
    #[error("invalid route: {reason}")]
    InvalidRoute {
        /// The reason the route is invalid.
        reason: String,
    },

    /// A receiver configuration is invalid.
    #[error("invalid receiver '{name}': {reason}")]
    InvalidReceiver {
        /// The receiver name.
        name: String,
        /// The reason the receiver is invalid.
        reason: String,
    },

    /// A silence is invalid.
    #[error("invalid silence: {reason}")]
    InvalidSilence {
        /// The reason the silence is invalid.
        reason: String,
    },

    /// Silence not found.
    #[error("silence not found: {id}")]
    SilenceNotFound {
        /// The silence ID that was not found.
        id: String,
    },

    /// The silence has already expired.
    #[error("silence already expired: {id}")]
    SilenceExpired {
        /// The silence ID.
        id: String,
    },

    /// Notification delivery failed.
    #[error("notification to '{receiver}' failed: {reason}")]
    NotificationFailed {
        /// The receiver the notification was addressed to.
        receiver: String,
        /// The reason the notification failed.
        reason: String,
    },

    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type for alert operations.
pub type Result<T> = std::result::Result<T, AlertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_alert() {
        let err = AlertError::InvalidAlert {
            reason: "empty label name".to_string(),
        };
        assert_eq!(err.to_string(), "invalid alert: empty label name");
    }

    #[test]
    fn error_display_invalid_matcher() {
        let err = AlertError::InvalidMatcher {
            matcher: "=api".to_string(),
            reason: "missing label name".to_string(),
        };
        assert_eq!(err.to_string(), "invalid matcher '=api': missing label name");
    }

    #[test]
    fn error_display_silence_not_found() {
        let err = AlertError::SilenceNotFound {
            id: "silence-123".to_string(),
        };
        assert_eq!(err.to_string(), "silence not found: silence-123");
    }

    #[test]
    fn error_display_notification_failed() {
        let err = AlertError::NotificationFailed {
            receiver: "ops".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "notification to 'ops' failed: connection refused"
        );
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let alert_err: AlertError = json_err.unwrap_err().into();
        assert!(matches!(alert_err, AlertError::SerializationError(_)));
    }
}
