//! Config bundle REST endpoints

use std::time::Duration;

use actix_web::{HttpResponse, get, post, web};
use teller_api::{BundleQuery, ConfigBundle, RestResult};

use crate::error::AppError;
use crate::model::common::AppState;

#[post("/v1/config/bundles")]
async fn publish(
    data: web::Data<AppState>,
    body: web::Json<ConfigBundle>,
) -> Result<HttpResponse, AppError> {
    let bundle = data.provider.publish(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(RestResult::ok(bundle.as_ref())))
}

/// Latest bundle; long-polls up to `waitMs` (capped) for `minVersion`.
#[get("/v1/config/bundles/{service}/{profile}")]
async fn fetch(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    params: web::Query<BundleQuery>,
) -> Result<HttpResponse, AppError> {
    let (service, profile) = path.into_inner();
    let wait = params
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or_default()
        .min(data.max_wait);

    let bundle = if wait.is_zero() {
        data.provider.fetch(&service, &profile, params.min_version).await?
    } else {
        data.provider
            .wait_for(&service, &profile, params.min_version, wait)
            .await?
    };
    Ok(HttpResponse::Ok().json(RestResult::ok(bundle.as_ref())))
}

#[get("/v1/config/bundles/{service}/{profile}/versions")]
async fn versions(data: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    let (service, profile) = path.into_inner();
    HttpResponse::Ok().json(RestResult::ok(data.provider.versions(&service, &profile).await))
}

#[get("/v1/config/bundles/{service}/{profile}/versions/{version}")]
async fn fetch_version(
    data: web::Data<AppState>,
    path: web::Path<(String, String, u64)>,
) -> Result<HttpResponse, AppError> {
    let (service, profile, version) = path.into_inner();
    let bundle = data.provider.fetch_version(&service, &profile, version).await?;
    Ok(HttpResponse::Ok().json(RestResult::ok(bundle.as_ref())))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(publish)
        .service(versions)
        .service(fetch_version)
        .service(fetch);
}
