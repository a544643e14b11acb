use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;
use std::net::IpAddr;

use crate::api::AppState;
use crate::geo::coordinate::Coordinate;

#[derive(Debug, Serialize)]
struct LookupResponse {
    ip: IpAddr,
    coordinate: Option<Coordinate>,
    hostname: Option<String>,
}

/// Map coordinate and reverse DNS name for one address
pub async fn lookup_ip(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let ip: IpAddr = match path.parse() {
        Ok(ip) => ip,
        Err(_) => {
            return HttpResponse::BadRequest().json(json!({
                "status": "error",
                "message": format!("not an IP address: {}", path.as_str()),
            }))
        }
    };

    let coordinate = state.resolver.resolve(ip);
    let hostname = state.dns.reverse_resolve(ip).await;

    HttpResponse::Ok().json(LookupResponse {
        ip,
        coordinate,
        hostname,
    })
}
