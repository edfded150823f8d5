//! Error types for Voxlink Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Already in a call")]
    Busy,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("Operation not allowed while call is {0}")]
    InvalidCallState(String),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Resampler error: {0}")]
    Resample(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short machine-readable reason, sent to the peer when a call is torn
    /// down because of this error.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::PermissionDenied(_) => "permission-denied",
            Error::DeviceNotFound(_) => "device-not-found",
            Error::UnsupportedPlatform(_) => "unsupported-platform",
            Error::NegotiationFailed(_) => "negotiation-failed",
            Error::ConnectionFailed(_) => "connection-failed",
            Error::Busy => "busy",
            Error::Timeout(_) => "timeout",
            _ => "failed",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::Network(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::NegotiationFailed(e.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for Error {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        Error::Resample(e.to_string())
    }
}

impl From<rubato::ResampleError> for Error {
    fn from(e: rubato::ResampleError) -> Self {
        Error::Resample(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for Error {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                Error::DeviceNotFound(e.to_string())
            }
            cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                Error::UnsupportedPlatform(e.to_string())
            }
            cpal::DefaultStreamConfigError::BackendSpecific { err } => backend_error(err),
        }
    }
}

impl From<cpal::BuildStreamError> for Error {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => Error::DeviceNotFound(e.to_string()),
            cpal::BuildStreamError::BackendSpecific { err } => backend_error(err),
            other => Error::UnsupportedPlatform(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for Error {
    fn from(e: cpal::PlayStreamError) -> Self {
        match e {
            cpal::PlayStreamError::DeviceNotAvailable => Error::DeviceNotFound(e.to_string()),
            cpal::PlayStreamError::BackendSpecific { err } => backend_error(err),
        }
    }
}

// Capture backends only report refused access as free text.
fn backend_error(err: cpal::BackendSpecificError) -> Error {
    let description = err.description.to_lowercase();
    if description.contains("permission")
        || description.contains("denied")
        || description.contains("not allowed")
    {
        Error::PermissionDenied(err.description)
    } else {
        Error::UnsupportedPlatform(err.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_map_to_taxonomy() {
        let denied = backend_error(cpal::BackendSpecificError {
            description: "Permission denied by user".to_string(),
        });
        assert!(matches!(denied, Error::PermissionDenied(_)));

        let other = backend_error(cpal::BackendSpecificError {
            description: "ALSA function failed".to_string(),
        });
        assert!(matches!(other, Error::UnsupportedPlatform(_)));
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(Error::Busy.reason(), "busy");
        assert_eq!(
            Error::ConnectionFailed("ice".into()).reason(),
            "connection-failed"
        );
        assert_eq!(Error::NotLoggedIn.reason(), "failed");
    }
}
