use actix_web::{web, HttpResponse};
use log::info;
use serde::Deserialize;

use crate::api::AppState;
use crate::capture::manager::CaptureManager;
use crate::models::config::CaptureConfig;
use crate::utils::error::CaptureError;

/// Request for starting capture
#[derive(Debug, Default, Deserialize)]
pub struct StartCaptureRequest {
    /// Device to capture on; defaults to the configured, then the preferred one
    pub interface: Option<String>,

    /// Overrides for this session only
    pub config: Option<CaptureConfig>,
}

/// List capture devices, preferred first
pub async fn list_devices(state: web::Data<AppState>) -> Result<HttpResponse, CaptureError> {
    let manager = state.manager.read().await;
    let devices = manager.enumerate_devices()?;

    Ok(HttpResponse::Ok().json(devices))
}

/// Current capture state
pub async fn get_capture_state(state: web::Data<AppState>) -> HttpResponse {
    let manager = state.manager.read().await;
    HttpResponse::Ok().json(manager.current_state())
}

/// Replace the controller, stopping whatever the previous page left running
pub async fn init_capture(state: web::Data<AppState>) -> Result<HttpResponse, CaptureError> {
    let mut manager = state.manager.write().await;
    *manager = CaptureManager::attach(state.context.clone(), state.config.capture.clone()).await?;

    Ok(HttpResponse::Ok().json(manager.current_state()))
}

/// Start packet capture
pub async fn start_capture(
    state: web::Data<AppState>,
    request: Option<web::Json<StartCaptureRequest>>,
) -> Result<HttpResponse, CaptureError> {
    let request = request.map(web::Json::into_inner).unwrap_or_default();
    let manager = state.manager.read().await;

    let device = match request.interface.or_else(|| state.config.interface.clone()) {
        Some(device) => device,
        None => manager
            .current_state()
            .devices
            .into_iter()
            .next()
            .map(|d| d.name)
            .ok_or_else(|| CaptureError::DeviceNotFound("no capture device available".into()))?,
    };

    let config = request.config.unwrap_or_else(|| manager.config().clone());
    info!(
        "Starting capture with interface: {}, promiscuous: {}, filter: {:?}",
        device, config.promiscuous, config.filter
    );
    manager.start_capture_with(&device, &config).await?;

    Ok(HttpResponse::Ok().json(manager.current_state()))
}

/// Stop packet capture
pub async fn stop_capture(state: web::Data<AppState>) -> Result<HttpResponse, CaptureError> {
    let manager = state.manager.read().await;
    manager.stop_capture().await?;

    Ok(HttpResponse::Ok().json(manager.current_state()))
}
