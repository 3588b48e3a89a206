//! Config bundle REST surface: publish, fetch, history and long-poll.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{App, test, web};
use serde_json::{Value, json};
use teller_api::ConfigBundle;
use teller_config::ConfigSnapshotProvider;
use teller_registry::RegistryStore;
use teller_server::{AppState, api};

fn state(max_wait: Duration) -> web::Data<AppState> {
    web::Data::new(
        AppState::new(
            Arc::new(RegistryStore::new()),
            Arc::new(ConfigSnapshotProvider::in_memory()),
        )
        .with_max_wait(max_wait),
    )
}

fn bundle(version: u64) -> Value {
    json!({
        "serviceName": "card",
        "profile": "prod",
        "version": version,
        "properties": [
            {"key": "limit", "value": version.to_string()},
            {"key": "currency", "value": "EUR"}
        ]
    })
}

#[actix_web::test]
async fn test_publish_then_fetch_latest_and_history() {
    let app = test::init_service(
        App::new()
            .app_data(state(Duration::from_secs(1)))
            .configure(api::routes),
    )
    .await;

    for version in [1, 2] {
        let req = test::TestRequest::post()
            .uri("/v1/config/bundles")
            .set_json(bundle(version))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["version"], version);
    }

    let req = test::TestRequest::get()
        .uri("/v1/config/bundles/card/prod")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"]["version"], 2);
    assert_eq!(body["data"]["properties"][0]["key"], "limit");
    assert_eq!(body["data"]["properties"][1]["key"], "currency");

    let req = test::TestRequest::get()
        .uri("/v1/config/bundles/card/prod/versions")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"], json!([1, 2]));

    let req = test::TestRequest::get()
        .uri("/v1/config/bundles/card/prod/versions/1")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"]["properties"][0]["value"], "1");
}

#[actix_web::test]
async fn test_stale_publish_conflicts() {
    let app = test::init_service(
        App::new()
            .app_data(state(Duration::from_secs(1)))
            .configure(api::routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/config/bundles")
        .set_json(bundle(3))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    let req = test::TestRequest::post()
        .uri("/v1/config/bundles")
        .set_json(bundle(3))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], teller_common::error::STALE_VERSION.code);
}

#[actix_web::test]
async fn test_missing_bundle_is_not_found() {
    let app = test::init_service(
        App::new()
            .app_data(state(Duration::from_secs(1)))
            .configure(api::routes),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/v1/config/bundles/card/prod")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::get()
        .uri("/v1/config/bundles/card/prod/versions")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"], json!([]));
}

#[actix_web::test]
async fn test_long_poll_resolves_on_publish() {
    let state = state(Duration::from_secs(5));
    let provider = state.provider.clone();
    let app = test::init_service(App::new().app_data(state.clone()).configure(api::routes)).await;

    provider.publish(ConfigBundle::new("card", "prod", 1)).await.unwrap();

    let publisher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        provider.publish(ConfigBundle::new("card", "prod", 2)).await.unwrap();
    });

    let started = Instant::now();
    let req = test::TestRequest::get()
        .uri("/v1/config/bundles/card/prod?minVersion=2&waitMs=3000")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"]["version"], 2);
    assert!(started.elapsed() < Duration::from_secs(3));
    publisher.await.unwrap();
}

#[actix_web::test]
async fn test_long_poll_wait_is_capped() {
    let state = state(Duration::from_millis(100));
    let app = test::init_service(App::new().app_data(state.clone()).configure(api::routes)).await;
    state
        .provider
        .publish(ConfigBundle::new("card", "prod", 1))
        .await
        .unwrap();

    // Asks for a minute, gets the server cap
    let started = Instant::now();
    let req = test::TestRequest::get()
        .uri("/v1/config/bundles/card/prod?minVersion=2&waitMs=60000")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    assert!(started.elapsed() < Duration::from_secs(5));
}
