use serde::Serialize;
use thiserror::Error;

/// Failure to acquire local capture
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("No matching device: {0}")]
    NotFound(String),
    #[error("Capture backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Negotiation error: {0}")]
    Negotiation(String),
    #[error("Signaling delivery failure: {0}")]
    Signaling(String),
    #[error("ICE failure: {0}")]
    IceFailure(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of a [`SessionError`], exposed to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Device,
    Negotiation,
    Signaling,
    IceFailure,
    Config,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Device(_) => ErrorKind::Device,
            SessionError::Negotiation(_) => ErrorKind::Negotiation,
            SessionError::Signaling(_) => ErrorKind::Signaling,
            SessionError::IceFailure(_) => ErrorKind::IceFailure,
            SessionError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn negotiation(message: impl Into<String>) -> Self {
        SessionError::Negotiation(message.into())
    }

    pub fn signaling(message: impl Into<String>) -> Self {
        SessionError::Signaling(message.into())
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
