//! HTTP handlers for resource endpoints

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::Value;
use tracing::{debug, error, warn};

use restless_common::{ApiError, Error, Result};
use restless_core::{ResourceApi, Response};

/// Shared handler state
pub struct AppState {
    pub api: Arc<ResourceApi>,
}

/// Mount the resource routes under the configured URL prefix
pub fn configure(api: Arc<ResourceApi>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg: &mut web::ServiceConfig| {
        let prefix = api.config().url_prefix.trim_end_matches('/').to_string();
        cfg.app_data(web::Data::new(AppState { api }))
            .route("/health", web::get().to(health_handler))
            .service(
                web::scope(&prefix)
                    // before /{collection}/{id} so "eval" is never read as a collection
                    .route("/eval/{collection}", web::get().to(eval_handler))
                    .route("/{collection}", web::get().to(list_handler))
                    .route("/{collection}", web::post().to(create_handler))
                    .route("/{collection}", web::patch().to(update_many_handler))
                    .route("/{collection}", web::put().to(update_many_handler))
                    .route("/{collection}", web::delete().to(delete_many_handler))
                    .route("/{collection}/{id}", web::get().to(get_handler))
                    .route("/{collection}/{id}", web::patch().to(update_handler))
                    .route("/{collection}/{id}", web::put().to(update_handler))
                    .route("/{collection}/{id}", web::delete().to(delete_handler))
                    .route("/{collection}/{id}/{relation}", web::get().to(related_handler))
                    .route("/{collection}/{id}/{relation}/{related_id}", web::get().to(related_item_handler)),
            );
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /{collection}
pub async fn list_handler(state: web::Data<AppState>, path: web::Path<String>, req: HttpRequest) -> HttpResponse {
    let collection = path.into_inner();
    let params = query_params(&req);
    let page = match page_param(&params) {
        Ok(page) => page,
        Err(err) => return error_response(&err),
    };
    run(&state, move |api| api.get_many(&collection, param(&params, "q"), page)).await
}

/// GET /{collection}/{id}
pub async fn get_handler(state: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    let (collection, id) = path.into_inner();
    run(&state, move |api| api.get_single(&collection, &id)).await
}

/// GET /{collection}/{id}/{relation}
pub async fn related_handler(state: web::Data<AppState>, path: web::Path<(String, String, String)>) -> HttpResponse {
    let (collection, id, relation) = path.into_inner();
    run(&state, move |api| api.get_related(&collection, &id, &relation, None)).await
}

/// GET /{collection}/{id}/{relation}/{related_id}
pub async fn related_item_handler(
    state: web::Data<AppState>,
    path: web::Path<(String, String, String, String)>,
) -> HttpResponse {
    let (collection, id, relation, related_id) = path.into_inner();
    run(&state, move |api| {
        api.get_related(&collection, &id, &relation, Some(&related_id))
    })
    .await
}

/// GET /eval/{collection}
pub async fn eval_handler(state: web::Data<AppState>, path: web::Path<String>, req: HttpRequest) -> HttpResponse {
    let collection = path.into_inner();
    let params = query_params(&req);
    run(&state, move |api| {
        api.evaluate(&collection, param(&params, "functions"), param(&params, "q"))
    })
    .await
}

/// POST /{collection}
pub async fn create_handler(state: web::Data<AppState>, path: web::Path<String>, body: web::Bytes) -> HttpResponse {
    let collection = path.into_inner();
    let body = match json_body(&body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    run(&state, move |api| api.create(&collection, body)).await
}

/// PATCH|PUT /{collection}/{id}
pub async fn update_handler(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    let (collection, id) = path.into_inner();
    let body = match json_body(&body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    run(&state, move |api| api.update_single(&collection, &id, body)).await
}

/// PATCH|PUT /{collection}?q=...
pub async fn update_many_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let collection = path.into_inner();
    let params = query_params(&req);
    let body = match json_body(&body) {
        Ok(body) => body,
        Err(err) => return error_response(&err),
    };
    run(&state, move |api| api.update_many(&collection, param(&params, "q"), body)).await
}

/// DELETE /{collection}/{id}
pub async fn delete_handler(state: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    let (collection, id) = path.into_inner();
    run(&state, move |api| api.delete_single(&collection, &id)).await
}

/// DELETE /{collection}?q=...
pub async fn delete_many_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
) -> HttpResponse {
    let collection = path.into_inner();
    let params = query_params(&req);
    run(&state, move |api| api.delete_many(&collection, param(&params, "q"))).await
}

/// Health check
pub async fn health_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "restless",
        "version": env!("CARGO_PKG_VERSION"),
        "collections": state.api.registry().len(),
    }))
}

// ============================================================================
// Helpers
// ============================================================================

/// Run a resource operation off the async executor
async fn run<F>(state: &web::Data<AppState>, op: F) -> HttpResponse
where
    F: FnOnce(&ResourceApi) -> Result<Response> + Send + 'static,
{
    let api = state.api.clone();
    match web::block(move || op(&api)).await {
        Ok(Ok(response)) => to_http(response),
        Ok(Err(err)) => error_response(&err),
        Err(err) => {
            error!(error = %err, "Blocking task failed");
            HttpResponse::InternalServerError().json(ApiError::new("internal_error", err.to_string()))
        }
    }
}

fn to_http(response: Response) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut builder = HttpResponse::build(status);
    match response.body {
        Some(body) => builder.json(body),
        None => builder.finish(),
    }
}

/// Render an error as `{"code", "message", "errors"?}` with its status
pub fn error_response(err: &Error) -> HttpResponse {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    } else if matches!(err, Error::ProcessingVeto { .. }) {
        warn!(error = %err, "Request vetoed");
    } else {
        debug!(error = %err, status = status.as_u16(), "Request rejected");
    }
    HttpResponse::build(status).json(ApiError::from(err))
}

fn query_params(req: &HttpRequest) -> HashMap<String, String> {
    url::form_urlencoded::parse(req.query_string().as_bytes())
        .into_owned()
        .collect()
}

fn param<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(String::as_str)
}

fn page_param(params: &HashMap<String, String>) -> Result<Option<usize>> {
    param(params, "page")
        .map(|raw| {
            raw.trim()
                .parse::<usize>()
                .map_err(|_| Error::InvalidQueryParam(format!("'page' must be a positive integer, got '{raw}'")))
        })
        .transpose()
}

/// An empty body decodes as `null` and is rejected by the deserializer
fn json_body(bytes: &web::Bytes) -> Result<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| Error::invalid_field("body", format!("not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_param() {
        let mut params = HashMap::new();
        assert_eq!(page_param(&params).unwrap(), None);
        params.insert("page".to_string(), "3".to_string());
        assert_eq!(page_param(&params).unwrap(), Some(3));
        params.insert("page".to_string(), "three".to_string());
        assert!(matches!(page_param(&params), Err(Error::InvalidQueryParam(_))));
    }

    #[test]
    fn test_json_body() {
        assert_eq!(json_body(&web::Bytes::from_static(b"  ")).unwrap(), Value::Null);
        assert_eq!(json_body(&web::Bytes::from_static(b"{\"a\": 1}")).unwrap()["a"], 1);
        let err = json_body(&web::Bytes::from_static(b"{oops")).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_error_response_status() {
        assert_eq!(error_response(&Error::veto(418, "teapot")).status().as_u16(), 418);
        assert_eq!(error_response(&Error::NoResultFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            error_response(&Error::Storage("disk".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
