// HTTP surface of the gateway
// Every path not served by the gateway itself is authenticated, rate
// limited and forwarded through the router.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::http::header::{AUTHORIZATION, CONTENT_TYPE};
use actix_web::{HttpRequest, HttpResponse, ResponseError, get, web};
use serde::Serialize;
use teller_api::RestResult;
use teller_common::TellerError;
use tracing::debug;

use crate::auth::{Authorizer, Identity, PublicPaths, bearer_token};
use crate::rate_limit::RateLimiter;
use crate::router::GatewayRouter;
use crate::upstream::{ForwardRequest, UpstreamResponse, is_hop_by_hop};

pub const AUTH_HEADER_PREFIX: &str = "x-auth-";
pub const AUTH_SUBJECT_HEADER: &str = "x-auth-subject";
pub const AUTH_CLAIM_HEADER_PREFIX: &str = "x-auth-claim-";
const PROBLEM_JSON: &str = "application/problem+json";

/// Shared state of the gateway HTTP surface
pub struct GatewayState {
    pub router: Arc<GatewayRouter>,
    pub authorizer: Arc<dyn Authorizer>,
    pub public_paths: PublicPaths,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Error body: `{timestamp, status, errorCode, path}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    timestamp: String,
    status: u16,
    error_code: &'a str,
    path: &'a str,
}

/// A gateway failure tied to the request path it happened on.
#[derive(Debug)]
pub struct GatewayError {
    pub error: TellerError,
    pub path: String,
}

impl GatewayError {
    pub fn new(error: TellerError, path: &str) -> Self {
        Self {
            error,
            path: path.to_string(),
        }
    }
}

impl Display for GatewayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = ErrorBody {
            timestamp: chrono::Utc::now().to_rfc3339(),
            status: status.as_u16(),
            error_code: self.error.error_code().name,
            path: &self.path,
        };
        HttpResponse::build(status)
            .insert_header((CONTENT_TYPE, PROBLEM_JSON))
            .json(body)
    }
}

#[get("/_gateway/routes")]
async fn list_routes(state: web::Data<GatewayState>) -> HttpResponse {
    HttpResponse::Ok().json(RestResult::ok(state.router.route_statuses()))
}

#[get("/actuator/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "UP" }))
}

/// Forward any other request along its route.
pub async fn proxy(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let path = req.path().to_string();
    if !is_plain_path(&path) {
        return Err(GatewayError::new(
            TellerError::IllegalArgument(format!("path {path:?} contains dot segments")),
            &path,
        ));
    }

    let identity = if state.public_paths.is_public(&path) {
        None
    } else {
        let header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        state
            .authorizer
            .authorize(bearer_token(header), &path)
            .await
            .map_err(|e| GatewayError::new(e, &path))?
    };

    let client_ip = req.peer_addr().map(|addr| addr.ip().to_string());
    let limit_key = identity
        .as_ref()
        .map(|i| i.subject.clone())
        .or(client_ip.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    state
        .rate_limiter
        .try_acquire(&limit_key)
        .map_err(|e| GatewayError::new(e, &path))?;

    let request = forward_request(&req, body, identity.as_ref(), client_ip.as_deref());
    debug!(method = %request.method, path = %path, "Routing request");

    let response = state
        .router
        .route(request)
        .await
        .map_err(|e| GatewayError::new(e, &path))?;
    Ok(into_http_response(response))
}

/// Public-path checks, route matching and the upstream URL all see the
/// same path, so none of its segments may be `.`, `..` or hide a separator,
/// encoded or not.
fn is_plain_path(path: &str) -> bool {
    path.split('/').all(|segment| {
        let segment = segment.to_ascii_lowercase();
        if segment.contains('\\') || segment.contains("%2f") || segment.contains("%5c") {
            return false;
        }
        let decoded = segment.replace("%2e", ".");
        decoded != "." && decoded != ".."
    })
}

/// Build the forwarded request. Inbound `x-auth-*` headers are dropped so
/// callers cannot forge identity; the gateway's own are added instead.
fn forward_request(
    req: &HttpRequest,
    body: web::Bytes,
    identity: Option<&Identity>,
    client_ip: Option<&str>,
) -> ForwardRequest {
    let mut headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter(|(name, _)| !name.as_str().starts_with(AUTH_HEADER_PREFIX))
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    if let Some(identity) = identity {
        headers.push((AUTH_SUBJECT_HEADER.to_string(), identity.subject.clone()));
        for (name, value) in &identity.claims {
            headers.push((
                format!("{}{}", AUTH_CLAIM_HEADER_PREFIX, name.to_ascii_lowercase()),
                value.clone(),
            ));
        }
    }
    if let Some(ip) = client_ip {
        headers.push(("x-forwarded-for".to_string(), ip.to_string()));
    }

    let query = req.query_string();
    ForwardRequest {
        method: req.method().as_str().to_string(),
        path: req.path().to_string(),
        query: (!query.is_empty()).then(|| query.to_string()),
        headers,
        body,
    }
}

fn into_http_response(response: UpstreamResponse) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &response.headers {
        builder.append_header((name.as_str(), value.as_str()));
    }
    builder.body(response.body)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_routes)
        .service(health)
        .default_service(web::to(proxy));
}
