//! End-to-end tests over the HTTP surface

use std::sync::Arc;

use actix_web::{http::StatusCode, test, App};
use serde_json::{json, Value};

use restless_common::ApiConfig;
use restless_core::{sample, ResourceApi};
use restless_server::configure;

fn api() -> Arc<ResourceApi> {
    let registry = sample::registry().unwrap();
    let store = sample::store(registry.clone()).unwrap();
    Arc::new(ResourceApi::new(registry, Arc::new(store), ApiConfig::default()))
}

fn encode(value: &Value) -> String {
    url::form_urlencoded::byte_serialize(value.to_string().as_bytes()).collect()
}

macro_rules! app {
    () => {
        test::init_service(App::new().configure(configure(api()))).await
    };
}

#[actix_rt::test]
async fn test_list_with_like_filter() {
    let app = app!();
    let q = json!({"filters": [{"name": "name", "op": "like", "val": "%y%"}]});
    let req = test::TestRequest::get().uri(&format!("/api/person?q={}", encode(&q))).to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let names: Vec<&str> = body["objects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["Mary", "Amy"]);
    assert_eq!(body["num_results"], json!(2));
}

#[actix_rt::test]
async fn test_eval_sum() {
    let app = app!();
    let functions = json!([{"name": "sum", "field": "age"}]);
    let req = test::TestRequest::get()
        .uri(&format!("/api/eval/person?functions={}", encode(&functions)))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({"sum__age": 90}));
}

#[actix_rt::test]
async fn test_create_then_get() {
    let app = app!();
    let req = test::TestRequest::post()
        .uri("/api/person")
        .set_json(json!({"name": "Zoe", "age": 25}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({"id": 4}));

    let req = test::TestRequest::get().uri("/api/person/4").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["name"], json!("Zoe"));
}

#[actix_rt::test]
async fn test_bulk_patch() {
    let app = app!();
    let req = test::TestRequest::patch()
        .uri("/api/person")
        .set_json(json!({"other": 7.0}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({"num_modified": 3}));

    let req = test::TestRequest::get().uri("/api/person").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let others: Vec<&Value> = body["objects"].as_array().unwrap().iter().map(|o| &o["other"]).collect();
    assert_eq!(others, [&json!(7.0); 3]);
}

#[actix_rt::test]
async fn test_put_is_patch() {
    let app = app!();
    let req = test::TestRequest::put()
        .uri("/api/person/2")
        .set_json(json!({"age": 31}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["age"], json!(31));
}

#[actix_rt::test]
async fn test_remove_and_delete_related() {
    let app = app!();
    let req = test::TestRequest::patch()
        .uri("/api/person/1")
        .set_json(json!({"computers": {"remove": [{"id": 2, "__delete__": true}]}}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get().uri("/api/computer/2").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], json!("not_found"));
}

#[actix_rt::test]
async fn test_delete_single() {
    let app = app!();
    let req = test::TestRequest::delete().uri("/api/computer/2").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::delete().uri("/api/computer/2").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_rt::test]
async fn test_validation_errors_listed() {
    let app = app!();
    let req = test::TestRequest::post()
        .uri("/api/person")
        .set_json(json!({"age": "old", "birthday": "soon"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], json!("multiple_failures"));
    assert_eq!(body["errors"].as_array().unwrap().len(), 3);
}

#[actix_rt::test]
async fn test_method_not_allowed_and_unknown_collection() {
    let app = app!();
    let req = test::TestRequest::post()
        .uri("/api/tag")
        .set_json(json!({"name": "new"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::METHOD_NOT_ALLOWED);

    let req = test::TestRequest::get().uri("/api/robots").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_rt::test]
async fn test_bad_query_param() {
    let app = app!();
    let req = test::TestRequest::get().uri("/api/person?q=%7Bnope").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], json!("invalid_param"));

    let req = test::TestRequest::get().uri("/api/person?page=zero").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_rt::test]
async fn test_health() {
    let app = app!();
    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["collections"], json!(3));
}

#[actix_rt::test]
async fn test_related_routes() {
    let app = app!();
    let req = test::TestRequest::get().uri("/api/person/1/computers").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["num_results"], json!(2));

    let req = test::TestRequest::get().uri("/api/person/1/computers/2").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["name"], json!("lovelace"));

    let req = test::TestRequest::get().uri("/api/person/1/computers/3").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::get().uri("/api/computer/1/owner").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["name"], json!("Mary"));

    let req = test::TestRequest::get().uri("/api/computer/1/owner/1").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], json!("invalid_param"));

    let req = test::TestRequest::get().uri("/api/person/1/pets").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_rt::test]
async fn test_page_out_of_range() {
    let app = app!();
    let req = test::TestRequest::get()
        .uri(&format!("/api/person?page={}", usize::MAX))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], json!("invalid_param"));
}

#[actix_rt::test]
async fn test_delete_tagged_computer() {
    let app = app!();
    let req = test::TestRequest::delete().uri("/api/computer/1").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::get().uri("/api/computer/1").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}
