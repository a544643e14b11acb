pub mod handlers;
pub mod routes;
pub mod websocket;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::capture::context::PcapContext;
use crate::capture::manager::CaptureManager;
use crate::geo::coordinate::CoordinateResolver;
use crate::geo::dns::ReverseDns;
use crate::models::config::AppConfig;
use crate::utils::error::CaptureError;

/// Shared state for all HTTP handlers
pub struct AppState {
    /// Process-wide capture context
    pub context: Arc<PcapContext>,

    /// Controller of the current UI session; replaced on `/api/capture/init`
    pub manager: RwLock<CaptureManager>,

    /// Startup configuration
    pub config: AppConfig,

    /// IP to map coordinate lookup
    pub resolver: Arc<dyn CoordinateResolver>,

    /// Cached reverse DNS
    pub dns: ReverseDns,
}

impl ResponseError for CaptureError {
    fn status_code(&self) -> StatusCode {
        match self {
            CaptureError::InsufficientPermissions => StatusCode::FORBIDDEN,
            CaptureError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            CaptureError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CaptureError::AlreadyCapturing(_) => StatusCode::CONFLICT,
            CaptureError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "status": "error",
            "kind": self.kind(),
            "message": self.to_string(),
        }))
    }
}
