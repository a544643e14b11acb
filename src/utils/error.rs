use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the capture session lifecycle
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum CaptureError {
    /// The platform denied raw capture privilege
    #[error("insufficient permissions to capture network traffic")]
    InsufficientPermissions,

    /// The requested device is not in the current enumeration
    #[error("network device not found: {0}")]
    DeviceNotFound(String),

    /// The capture library or driver could not be used at all
    #[error("packet capture backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A capture session is already running
    #[error("already capturing on {0}")]
    AlreadyCapturing(String),

    /// The capture backend failed while reading
    #[error("capture I/O error: {0}")]
    Io(String),
}

/// Fieldless discriminant of [`CaptureError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InsufficientPermissions,
    DeviceNotFound,
    BackendUnavailable,
    AlreadyCapturing,
    Io,
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::InsufficientPermissions => ErrorKind::InsufficientPermissions,
            CaptureError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            CaptureError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            CaptureError::AlreadyCapturing(_) => ErrorKind::AlreadyCapturing,
            CaptureError::Io(_) => ErrorKind::Io,
        }
    }

    /// Errors that only go away after user action (elevation, installing the driver)
    pub fn is_persistent(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InsufficientPermissions | ErrorKind::BackendUnavailable
        )
    }
}

impl From<pcap::Error> for CaptureError {
    fn from(err: pcap::Error) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();

        if lower.contains("permission") || lower.contains("not permitted") {
            CaptureError::InsufficientPermissions
        } else if lower.contains("no such device") || lower.contains("doesn't exist") {
            CaptureError::DeviceNotFound(message)
        } else {
            CaptureError::Io(message)
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;
