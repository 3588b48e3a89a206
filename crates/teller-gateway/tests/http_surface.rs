//! Gateway HTTP surface: auth hand-off, identity headers, rate limits and
//! error rendering.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::http::header::CONTENT_TYPE;
use actix_web::{App, test, web};
use teller_gateway::{
    AllowAllAuthorizer, Authorizer, CircuitBreakerRegistry, GatewayRouter, GatewayState,
    Identity, PublicPaths, RateLimitConfig, RateLimiter, RouteDefinition, RouteTable,
    StaticTokenAuthorizer, configure,
};

use common::{ScriptedUpstream, StaticDiscovery, instance};

struct Fixture {
    state: web::Data<GatewayState>,
    upstream: Arc<ScriptedUpstream>,
}

fn fixture(authorizer: Arc<dyn Authorizer>, limit: RateLimitConfig) -> Fixture {
    let discovery = Arc::new(StaticDiscovery::default());
    discovery.set("card", vec![instance("card", "card-1", 8001)]);
    let upstream = Arc::new(ScriptedUpstream::default());

    let mut card = RouteDefinition::new("card", "/card/**", "card");
    card.strip_prefix = 1;
    let routes = RouteTable::new(vec![
        card,
        RouteDefinition::new("search", "/search/**", "search"),
    ])
    .unwrap();

    let router = GatewayRouter::new(
        Arc::new(routes),
        discovery,
        upstream.clone(),
        Arc::new(CircuitBreakerRegistry::new()),
    );
    let state = web::Data::new(GatewayState {
        router: Arc::new(router),
        authorizer,
        public_paths: PublicPaths::default(),
        rate_limiter: Arc::new(RateLimiter::new(limit)),
    });
    Fixture { state, upstream }
}

fn token_authorizer() -> Arc<dyn Authorizer> {
    Arc::new(
        StaticTokenAuthorizer::new()
            .with_token("t-alice", Identity::new("alice").with_claim("role", "teller")),
    )
}

fn peer() -> SocketAddr {
    "10.1.2.3:40000".parse().unwrap()
}

#[actix_web::test]
async fn test_missing_token_is_rejected_with_problem_json() {
    let f = fixture(token_authorizer(), RateLimitConfig::default());
    let app = test::init_service(App::new().app_data(f.state.clone()).configure(configure)).await;

    let req = test::TestRequest::get()
        .uri("/card/api/cards")
        .peer_addr(peer())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 401);
    assert_eq!(
        resp.headers().get(CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], 401);
    assert_eq!(body["errorCode"], "AUTHENTICATION_FAILED");
    assert_eq!(body["path"], "/card/api/cards");
    assert!(body["timestamp"].is_string());
    assert!(f.upstream.calls().is_empty());
}

#[actix_web::test]
async fn test_identity_is_forwarded_and_forged_headers_dropped() {
    let f = fixture(token_authorizer(), RateLimitConfig::default());
    let app = test::init_service(App::new().app_data(f.state.clone()).configure(configure)).await;

    let req = test::TestRequest::get()
        .uri("/card/api/cards?page=2")
        .insert_header(("Authorization", "Bearer t-alice"))
        .insert_header(("x-auth-subject", "mallory"))
        .peer_addr(peer())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    assert_eq!(body, "from card-1");

    let calls = f.upstream.calls();
    assert_eq!(calls.len(), 1);
    let forwarded = &calls[0].request;
    assert_eq!(calls[0].upstream_path, "/api/cards");
    assert_eq!(forwarded.query.as_deref(), Some("page=2"));
    assert_eq!(forwarded.header("x-auth-subject"), Some("alice"));
    assert_eq!(forwarded.header("x-auth-claim-role"), Some("teller"));
    assert_eq!(
        forwarded
            .headers
            .iter()
            .filter(|(n, _)| n == "x-auth-subject")
            .count(),
        1
    );
    assert_eq!(forwarded.header("x-forwarded-for"), Some("10.1.2.3"));
}

#[actix_web::test]
async fn test_public_paths_bypass_the_authorizer() {
    let f = fixture(token_authorizer(), RateLimitConfig::default());
    let app = test::init_service(App::new().app_data(f.state.clone()).configure(configure)).await;

    let req = test::TestRequest::get()
        .uri("/card/v3/api-docs")
        .peer_addr(peer())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    let calls = f.upstream.calls();
    assert_eq!(calls[0].upstream_path, "/v3/api-docs");
    assert_eq!(calls[0].request.header("x-auth-subject"), None);
}

#[actix_web::test]
async fn test_dot_segments_cannot_reach_protected_routes() {
    let f = fixture(token_authorizer(), RateLimitConfig::default());
    let app = test::init_service(App::new().app_data(f.state.clone()).configure(configure)).await;

    for uri in [
        "/actuator/../card/api/cards",
        "/actuator/%2e%2e/card/api/cards",
        "/actuator/%2E./card/api/cards",
        "/card/./api/cards",
        "/actuator/..%2fcard/api/cards",
    ] {
        let req = test::TestRequest::get().uri(uri).peer_addr(peer()).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "{uri}");
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["errorCode"], "PARAMETER_VALIDATE_ERROR");
    }
    assert!(f.upstream.calls().is_empty());

    // Dots inside a segment are ordinary characters
    let req = test::TestRequest::get()
        .uri("/card/api/cards/v1.2..3")
        .insert_header(("Authorization", "Bearer t-alice"))
        .peer_addr(peer())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(f.upstream.calls()[0].upstream_path, "/api/cards/v1.2..3");
}

#[actix_web::test]
async fn test_rate_limit_keyed_by_caller_ip() {
    let limit = RateLimitConfig {
        max_requests: 1,
        window_ms: 60_000,
        enabled: true,
    };
    let f = fixture(Arc::new(AllowAllAuthorizer), limit);
    let app = test::init_service(App::new().app_data(f.state.clone()).configure(configure)).await;

    let first = test::TestRequest::get()
        .uri("/card/a")
        .peer_addr(peer())
        .to_request();
    assert_eq!(test::call_service(&app, first).await.status(), 200);

    let second = test::TestRequest::get()
        .uri("/card/a")
        .peer_addr(peer())
        .to_request();
    let resp = test::call_service(&app, second).await;
    assert_eq!(resp.status(), 429);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["errorCode"], "RATE_LIMITED");

    let other_caller = test::TestRequest::get()
        .uri("/card/a")
        .peer_addr("10.9.9.9:1234".parse().unwrap())
        .to_request();
    assert_eq!(test::call_service(&app, other_caller).await.status(), 200);
}

#[actix_web::test]
async fn test_routing_failures_render_gateway_errors() {
    let f = fixture(Arc::new(AllowAllAuthorizer), RateLimitConfig::default());
    let app = test::init_service(App::new().app_data(f.state.clone()).configure(configure)).await;

    let req = test::TestRequest::get().uri("/search/q").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["errorCode"], "NO_HEALTHY_INSTANCE");

    let req = test::TestRequest::get().uri("/loans/1").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["errorCode"], "ROUTE_NOT_FOUND");
}

#[actix_web::test]
async fn test_operator_route_listing() {
    let f = fixture(token_authorizer(), RateLimitConfig::default());
    let app = test::init_service(App::new().app_data(f.state.clone()).configure(configure)).await;

    let req = test::TestRequest::get().uri("/_gateway/routes").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"][0]["id"], "card");
    assert_eq!(body["data"][0]["circuitState"], "CLOSED");
    assert_eq!(body["data"][1]["service"], "search");
}
