//! Registry REST endpoints

use actix_web::{HttpResponse, delete, get, post, put, web};
use serde::Deserialize;
use teller_api::{InstanceRegistration, RegisterResponse, RestResult, StatusUpdate};
use teller_common::TellerError;

use crate::error::AppError;
use crate::model::common::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LookupParam {
    /// Include instances that are not UP
    all: bool,
}

#[post("/v1/registry/instances")]
async fn register(
    data: web::Data<AppState>,
    body: web::Json<InstanceRegistration>,
) -> Result<HttpResponse, AppError> {
    let registration = body.into_inner();
    let lease_secs = registration
        .lease_duration_secs
        .unwrap_or(data.lease_duration_secs);
    let lease = data.registry.register(registration, lease_secs)?;

    Ok(HttpResponse::Ok().json(RestResult::ok(RegisterResponse {
        instance_id: lease.instance_id.clone(),
        lease,
    })))
}

#[put("/v1/registry/instances/{id}/lease")]
async fn renew(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let lease = data.registry.renew(&path)?;
    Ok(HttpResponse::Ok().json(RestResult::ok(lease)))
}

#[put("/v1/registry/instances/{id}/status")]
async fn set_status(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<StatusUpdate>,
) -> Result<HttpResponse, AppError> {
    let updated = data.registry.set_status(&path, body.status)?;
    Ok(HttpResponse::Ok().json(RestResult::ok(updated)))
}

#[delete("/v1/registry/instances/{id}")]
async fn deregister(data: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let removed = data.registry.deregister(&path);
    HttpResponse::Ok().json(RestResult::ok(removed))
}

#[get("/v1/registry/instances/{id}")]
async fn instance(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let instance = data
        .registry
        .instance(&path)
        .ok_or_else(|| TellerError::UnknownInstance(path.into_inner()))?;
    Ok(HttpResponse::Ok().json(RestResult::ok(instance)))
}

#[get("/v1/registry/services")]
async fn services(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(RestResult::ok(data.registry.services()))
}

#[get("/v1/registry/services/{name}/instances")]
async fn lookup(
    data: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<LookupParam>,
) -> HttpResponse {
    let instances = if params.all {
        data.registry.lookup_all(&path)
    } else {
        data.registry.lookup(&path)
    };
    HttpResponse::Ok().json(RestResult::ok(instances))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(register)
        .service(renew)
        .service(set_status)
        .service(deregister)
        .service(instance)
        .service(services)
        .service(lookup);
}
