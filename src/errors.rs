use std::fmt;

use thiserror::Error;

/// Failure classes surfaced by the ONVIF adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorKind {
    Timeout,
    AuthFailure,
    MalformedResponse,
    Unreachable,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolErrorKind::Timeout => write!(f, "timeout"),
            ProtocolErrorKind::AuthFailure => write!(f, "auth failure"),
            ProtocolErrorKind::MalformedResponse => write!(f, "malformed response"),
            ProtocolErrorKind::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Error returned by every adapter call. The adapter never retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("ONVIF {kind}: {message}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::Timeout, message)
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::AuthFailure, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::MalformedResponse, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::Unreachable, message)
    }

    /// The device answered, so the failure is about its data rather than the link.
    pub fn is_reachable(&self) -> bool {
        self.kind == ProtocolErrorKind::MalformedResponse
    }
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailure { message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Device unreachable: {message}")]
    Unreachable { message: String },

    #[error("No valid credentials for {address}:{port}")]
    NoValidCredentials { address: String, port: u16 },

    #[error("Camera manager is not initialized")]
    NotInitialized,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },
}

impl CameraError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    pub fn no_valid_credentials(address: impl Into<String>, port: u16) -> Self {
        Self::NoValidCredentials { address: address.into(), port }
    }

    /// Protocol kind behind this error, if it came from the adapter.
    pub fn protocol_kind(&self) -> Option<ProtocolErrorKind> {
        match self {
            CameraError::Timeout { .. } => Some(ProtocolErrorKind::Timeout),
            CameraError::AuthFailure { .. } => Some(ProtocolErrorKind::AuthFailure),
            CameraError::MalformedResponse { .. } => Some(ProtocolErrorKind::MalformedResponse),
            CameraError::Unreachable { .. } => Some(ProtocolErrorKind::Unreachable),
            _ => None,
        }
    }
}

impl From<ProtocolError> for CameraError {
    fn from(err: ProtocolError) -> Self {
        let message = err.message;
        match err.kind {
            ProtocolErrorKind::Timeout => CameraError::Timeout { message },
            ProtocolErrorKind::AuthFailure => CameraError::AuthFailure { message },
            ProtocolErrorKind::MalformedResponse => CameraError::MalformedResponse { message },
            ProtocolErrorKind::Unreachable => CameraError::Unreachable { message },
        }
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_maps_to_camera_error_by_kind() {
        let err: CameraError = ProtocolError::unreachable("connection refused").into();
        assert!(matches!(err, CameraError::Unreachable { .. }));
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::Unreachable));

        let err: CameraError = ProtocolError::timeout("5s elapsed").into();
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::Timeout));

        assert_eq!(CameraError::NotInitialized.protocol_kind(), None);
    }

    #[test]
    fn test_only_malformed_counts_as_reachable() {
        assert!(ProtocolError::malformed("no Manufacturer").is_reachable());
        assert!(!ProtocolError::auth_failure("401").is_reachable());
        assert!(!ProtocolError::timeout("slow").is_reachable());
    }
}
