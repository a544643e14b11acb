use serde::{Deserialize, Serialize};

use crate::models::device::Device;
use crate::utils::error::CaptureError;

/// Lifecycle of the capture session controller
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No capture backend or privilege; nothing can start
    Unavailable,
    #[default]
    Idle,
    Starting,
    Capturing,
    Stopping,
}

impl SessionStatus {
    /// Whether a session currently owns (or is acquiring) the capture handle
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Capturing | SessionStatus::Stopping
        )
    }
}

/// Snapshot of the process-wide capture state
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcapState {
    /// Whether a capture backend was found at startup
    pub available: bool,

    /// Version string reported by the backend
    pub version: Option<String>,

    /// Current controller state
    pub status: SessionStatus,

    /// Devices from the most recent enumeration
    pub devices: Vec<Device>,

    /// Device of the running session, if any
    pub active_device: Option<Device>,

    /// Most recent lifecycle error
    pub error: Option<CaptureError>,
}
