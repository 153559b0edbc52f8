// Typed errors with thiserror. Nothing here is fatal: callers degrade to "no impression".

use thiserror::Error;

/// Tracker error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Intersection observation unavailable: {0}")]
    ObservationUnavailable(String),

    #[error("Transport failed to send event: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TrackerError::ObservationUnavailable("no IntersectionObserver".to_string());
        assert!(err.to_string().contains("no IntersectionObserver"));
    }

    #[test]
    fn serde_errors_convert() {
        let err: TrackerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, TrackerError::Serialization(_)));
    }
}
