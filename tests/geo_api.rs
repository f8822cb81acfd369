use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::{json, Value};
use tempfile::tempdir;
use tower::ServiceExt;

use company_directory::server::build_router;
use company_directory::{AppConfig, AppState, FailureReason, ResolutionState};

fn config(data_dir: &Path, geocoder: &Server) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        database_file_name: "api.db".into(),
        geocoder_api_key: Some(SecretString::from("test-key")),
        geocoder_base_url: geocoder.url_str("/1.x/"),
        geocoder_timeout_secs: 5,
        ..AppConfig::default()
    }
}

fn app(data_dir: &Path, geocoder: &Server) -> (Arc<AppState>, Router) {
    let state = Arc::new(AppState::initialize(config(data_dir, geocoder)).unwrap());
    let router = build_router(Arc::clone(&state));
    (state, router)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_owner(app: &Router) -> i64 {
    let (status, owner) = send(
        app,
        "POST",
        "/owners",
        Some(json!({ "full_name": "Ivan Petrov", "email": "ivan@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    owner["id"].as_i64().unwrap()
}

async fn create_company(app: &Router, owner_id: i64, name: &str, inn: &str, address: &str) -> i64 {
    let (status, company) = send(
        app,
        "POST",
        "/companies",
        Some(json!({
            "owner_id": owner_id,
            "name": name,
            "inn": inn,
            "city": "Moscow",
            "address": address
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{company}");
    company["id"].as_i64().unwrap()
}

fn point_body(pos: &str) -> Value {
    json!({
        "response": {
            "GeoObjectCollection": {
                "featureMember": [ { "GeoObject": { "Point": { "pos": pos } } } ]
            }
        }
    })
}

#[tokio::test]
async fn lookup_is_accepted_then_resolved() {
    let geocoder = Server::run();
    geocoder.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/1.x/"),
            request::query(url_decoded(contains(("apikey", "test-key")))),
            request::query(url_decoded(contains((
                "geocode",
                "Moscow, Tverskaya 1, Acme"
            ))))
        ])
        .times(1)
        .respond_with(json_encoded(point_body("37.611 55.760"))),
    );
    let dir = tempdir().unwrap();
    let (state, app) = app(dir.path(), &geocoder);

    let owner_id = create_owner(&app).await;
    let company_id = create_company(&app, owner_id, "Acme", "1234567890", "Tverskaya 1").await;
    let uri = format!("/geo/company/{company_id}");

    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({ "address": "Moscow, Tverskaya 1" }));

    state.coordinator().settle(company_id).await;

    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "latitude": "55.760000",
            "longitude": "37.611000",
            "address": "Moscow, Tverskaya 1"
        })
    );
    assert_eq!(state.coordinator().in_flight_count(), 0);
}

#[tokio::test]
async fn batch_reports_partial_without_triggering() {
    let geocoder = Server::run();
    geocoder.expect(
        Expectation::matching(request::method_path("GET", "/1.x/"))
            .times(2)
            .respond_with(json_encoded(point_body("37.611 55.760"))),
    );
    let dir = tempdir().unwrap();
    let (state, app) = app(dir.path(), &geocoder);

    let owner_id = create_owner(&app).await;
    let first = create_company(&app, owner_id, "Acme", "1111111111", "Tverskaya 1").await;
    let second = create_company(&app, owner_id, "Globex", "2222222222", "Arbat 2").await;

    send(&app, "GET", &format!("/geo/company/{first}"), None).await;
    state.coordinator().settle(first).await;

    let (status, body) = send(&app, "GET", "/geo/companies", None).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"].as_i64(), Some(second));
    assert!(items[0].get("latitude").is_none());
    assert_eq!(items[1]["latitude"], "55.760000");
    assert_eq!(state.coordinator().in_flight_count(), 0);

    send(&app, "GET", &format!("/geo/company/{second}"), None).await;
    state.coordinator().settle(second).await;

    let (status, body) = send(&app, "GET", "/geo/companies", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body
        .as_array()
        .unwrap()
        .iter()
        .all(|item| item["longitude"] == "37.611000"));
}

#[tokio::test]
async fn upstream_miss_is_recorded_and_retried() {
    let geocoder = Server::run();
    geocoder.expect(
        Expectation::matching(request::method_path("GET", "/1.x/"))
            .times(2)
            .respond_with(json_encoded(json!({
                "response": { "GeoObjectCollection": { "featureMember": [] } }
            }))),
    );
    let dir = tempdir().unwrap();
    let (state, app) = app(dir.path(), &geocoder);

    let owner_id = create_owner(&app).await;
    let company_id = create_company(&app, owner_id, "Acme", "1234567890", "Nowhere 0").await;
    let uri = format!("/geo/company/{company_id}");

    send(&app, "GET", &uri, None).await;
    state.coordinator().settle(company_id).await;

    let view = state.coordinator().current_view(company_id).unwrap();
    assert_eq!(view.state, ResolutionState::Failed);
    assert_eq!(view.failure_reason, Some(FailureReason::NotFoundUpstream));

    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({ "address": "Moscow, Nowhere 0" }));
    state.coordinator().settle(company_id).await;
}

#[tokio::test]
async fn missing_and_malformed_ids() {
    let geocoder = Server::run();
    let dir = tempdir().unwrap();
    let (_state, app) = app(dir.path(), &geocoder);

    let (status, body) = send(&app, "GET", "/geo/companies", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);

    let (status, body) = send(&app, "GET", "/geo/company/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "company 999 not found");

    let (status, body) = send(&app, "GET", "/geo/company/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn directory_crud_round() {
    let geocoder = Server::run();
    let dir = tempdir().unwrap();
    let (_state, app) = app(dir.path(), &geocoder);

    let owner_id = create_owner(&app).await;
    let company_id = create_company(&app, owner_id, "Acme", "1234567890", "Tverskaya 1").await;

    let (status, _) = send(
        &app,
        "POST",
        "/companies",
        Some(json!({ "owner_id": owner_id, "name": "Copy", "inn": "1234567890" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        "POST",
        "/companies",
        Some(json!({ "owner_id": owner_id, "name": "Short", "inn": "123" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, updated) = send(
        &app,
        "PUT",
        &format!("/companies/{company_id}"),
        Some(json!({ "name": "Acme Group", "city": "Kazan", "address": "Baumana 5" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Acme Group");

    let (status, companies) = send(&app, "GET", &format!("/owners/{owner_id}/companies"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(companies.as_array().unwrap().len(), 1);

    let (status, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["in_flight_resolutions"], 0);
    assert_eq!(health["config"]["has_geocoder_key"], true);

    let (status, body) = send(&app, "DELETE", &format!("/companies/{company_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "deleted" }));

    let (status, _) = send(&app, "GET", &format!("/geo/company/{company_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "DELETE", &format!("/owners/{owner_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", &format!("/owners/{owner_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
