use thiserror::Error;
use voice_session::{ConfigError, MediaAccessError, SessionError};

/// Top-level error for the native client.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Configuration ────────────────────────────────────────────────────────
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Environment variable {name} has an invalid value '{value}'")]
    InvalidSetting { name: &'static str, value: String },

    // ── Session errors ───────────────────────────────────────────────────────
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Session driver for {endpoint} has stopped")]
    DriverStopped { endpoint: String },

    // ── Backend HTTP errors ──────────────────────────────────────────────────
    #[error(transparent)]
    Api(#[from] ApiError),

    // ── Media errors ─────────────────────────────────────────────────────────
    #[error(transparent)]
    Media(#[from] MediaAccessError),
}

impl AppError {
    pub fn is_missing_identity(&self) -> bool {
        matches!(self, AppError::Session(e) if e.is_missing_identity())
    }
}

/// Failures talking to the backend's HTTP endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Backend returned {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Malformed response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ApiError {
    pub fn request(url: impl Into<String>, source: reqwest::Error) -> Self {
        ApiError::Request { url: url.into(), source }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Socket-level failures inside the native driver.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_identity_is_detected() {
        let err: AppError = SessionError::MissingIdentity { endpoint: "/ws".into() }.into();
        assert!(err.is_missing_identity());
        assert!(!AppError::DriverStopped { endpoint: "/ws".into() }.is_missing_identity());
    }

    #[test]
    fn test_status_code() {
        let err = ApiError::Status { url: "http://x/reset".into(), status: 503 };
        assert_eq!(err.status_code(), Some(503));
        assert!(err.to_string().contains("503"));
    }
}
