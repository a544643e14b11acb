use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

use crate::api::handlers::{
    capture::{get_capture_state, init_capture, list_devices, start_capture, stop_capture},
    lookup::lookup_ip,
};
use crate::api::websocket::ws_index;

/// Root endpoint to provide information about the API
async fn index() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "name": "ipmap API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "endpoints": [
            { "path": "/api/devices", "method": "GET", "description": "List capture devices" },
            { "path": "/api/capture/state", "method": "GET", "description": "Get the capture state" },
            { "path": "/api/capture/init", "method": "POST", "description": "Attach a fresh controller, stopping any stale session" },
            { "path": "/api/capture/start", "method": "POST", "description": "Start capture" },
            { "path": "/api/capture/stop", "method": "POST", "description": "Stop capture" },
            { "path": "/api/lookup/{ip}", "method": "GET", "description": "Coordinate and hostname of an address" },
            { "path": "/api/ws", "method": "GET", "description": "WebSocket stream of deltas and state changes" }
        ]
    }))
}

/// Configure API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index)).service(
        web::scope("/api")
            .route("/ws", web::get().to(ws_index))
            .route("/devices", web::get().to(list_devices))
            .service(
                web::scope("/capture")
                    .route("/state", web::get().to(get_capture_state))
                    .route("/init", web::post().to(init_capture))
                    .route("/start", web::post().to(start_capture))
                    .route("/stop", web::post().to(stop_capture)),
            )
            .route("/lookup/{ip}", web::get().to(lookup_ip)),
    );
}
