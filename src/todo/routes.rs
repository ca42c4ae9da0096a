//! `/todo` HTTP routes.
//!
//! Responses use a `{success, code, data | message}` JSON envelope.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use super::pagination::{self, Meta};
use super::{FieldError, TodoRequest, TodoService};
use crate::storage::StoreError;

/// Method and path of every route served by [`routes`].
pub const ROUTE_TABLE: &[(&str, &str)] = &[
    ("GET", "/todo"),
    ("GET", "/todo/:id"),
    ("POST", "/todo"),
    ("PUT", "/todo/:id"),
    ("DELETE", "/todo/:id"),
];

pub fn routes(service: Arc<TodoService>) -> Router {
    Router::new()
        .route("/todo", get(get_all).post(create))
        .route("/todo/:id", get(get_by_id).put(update).delete(delete))
        .with_state(service)
}

/// Failure responses.
#[derive(Debug)]
pub enum ApiError {
    Validation(Vec<FieldError>),
    Body(String),
    NotFound,
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "success": false,
                    "code": 400,
                    "message": "Validation errors in your request",
                    "errors": errors,
                }),
            ),
            ApiError::Body(reason) => {
                warn!(reason = %reason, "Unreadable request body");
                (
                    StatusCode::BAD_REQUEST,
                    json!({
                        "success": false,
                        "code": 400,
                        "message": "Validation errors in your request",
                        "error": "Check your body request",
                    }),
                )
            }
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({
                    "success": false,
                    "code": 404,
                    "message": "Item not found",
                }),
            ),
            ApiError::Internal(reason) => {
                error!(reason = %reason, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "success": false,
                        "code": 500,
                        "message": "There is something error",
                    }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn success(status: StatusCode, data: Value) -> Response {
    (
        status,
        Json(json!({
            "success": true,
            "code": status.as_u16(),
            "data": data,
        })),
    )
        .into_response()
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

/// Ids that do not parse cannot exist.
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound)
}

fn parse_body(body: Result<Json<TodoRequest>, JsonRejection>) -> Result<TodoRequest, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::Body(e.body_text()))?;
    request.validate().map_err(ApiError::Validation)?;
    Ok(request)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    q: Option<String>,
    page: Option<String>,
    per_page: Option<String>,
}

fn parse_number(field: &'static str, raw: Option<&str>) -> Result<Option<usize>, FieldError> {
    match raw.filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| FieldError {
            field,
            message: format!("{} must be a number", field),
        }),
    }
}

#[instrument(name = "todoHandler.GetAll", skip_all)]
async fn get_all(
    State(service): State<Arc<TodoService>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let mut errors = Vec::new();
    let page = parse_number("page", query.page.as_deref()).unwrap_or_else(|e| {
        errors.push(e);
        None
    });
    let per_page = parse_number("per_page", query.per_page.as_deref()).unwrap_or_else(|e| {
        errors.push(e);
        None
    });
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let current_page = pagination::current_page(page);
    let per_page = pagination::per_page(per_page);
    let offset = pagination::offset(current_page, per_page).ok_or_else(|| {
        ApiError::Validation(vec![FieldError {
            field: "page",
            message: "page is out of range".to_string(),
        }])
    })?;

    let page = service
        .get_all(query.q.as_deref(), per_page, offset)
        .await?;

    let meta = Meta {
        per_page,
        current_page,
        total_page: pagination::total_page(page.total, per_page),
        total_data: page.total,
    };

    Ok(Json(json!({
        "success": true,
        "code": 200,
        "data": to_value(&page.items)?,
        "meta": to_value(&meta)?,
    }))
    .into_response())
}

#[instrument(name = "todoHandler.GetByID", skip_all)]
async fn get_by_id(
    State(service): State<Arc<TodoService>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let todo = service.get_by_id(parse_id(&id)?).await?;
    Ok(success(StatusCode::OK, to_value(&todo)?))
}

#[instrument(name = "todoHandler.Create", skip_all)]
async fn create(
    State(service): State<Arc<TodoService>>,
    body: Result<Json<TodoRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = parse_body(body)?;
    let todo = service.create(request).await?;
    Ok(success(StatusCode::CREATED, to_value(&todo)?))
}

#[instrument(name = "todoHandler.Update", skip_all)]
async fn update(
    State(service): State<Arc<TodoService>>,
    Path(id): Path<String>,
    body: Result<Json<TodoRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let request = parse_body(body)?;
    service.update(id, request).await?;
    Ok(success(StatusCode::OK, json!({ "id": id })))
}

#[instrument(name = "todoHandler.Delete", skip_all)]
async fn delete(
    State(service): State<Arc<TodoService>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    service.delete(id).await?;
    Ok(success(StatusCode::OK, json!({ "id": id })))
}
