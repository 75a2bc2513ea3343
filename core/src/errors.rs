use thiserror::Error;

/// Invalid or missing backend configuration. Fatal to URL resolution only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Backend host is empty")]
    EmptyHost,

    #[error("Backend host '{host}' does not form a valid URL: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("USE_HTTPS must be either \"0\" (HTTP/WS) or \"1\" (HTTPS/WSS), got '{value}'")]
    InvalidSecureFlag { value: String },
}

/// An outbound event could not be turned into a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Microphone permission or device failures. Always retryable by the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAccessError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio capture is not supported here")]
    Unsupported,
}

/// Errors returned synchronously by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A user id is required before connecting to {endpoint}")]
    MissingIdentity { endpoint: String },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session is still closing")]
    Closing,

    #[error("User id cannot change while the session is active")]
    IdentityLocked,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    pub fn is_missing_identity(&self) -> bool {
        matches!(self, SessionError::MissingIdentity { .. })
    }
}
