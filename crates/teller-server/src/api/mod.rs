//! REST surface of the registry/config server

pub mod config;
pub mod registry;

use actix_web::{HttpResponse, get, web};
use serde_json::json;

use crate::model::common::AppState;

#[get("/health")]
async fn health(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "UP",
        "instances": data.registry.len(),
        "revision": data.registry.revision(),
    }))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.configure(registry::routes)
        .configure(config::routes)
        .service(health);
}
