use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::companies::{self, CompanyUpdate, NewCompany};
use crate::errors::AppError;
use crate::listing::ListingItem;
use crate::owners::{self, OwnerInput};
use crate::AppState;

const PAGE_LIMIT: usize = 10;

// ─── Error response ──────────────────────────────────────────────

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
    code: u16,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.1,
            code: self.0.as_u16(),
        };
        (self.0, Json(body)).into_response()
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = match &err {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            _ => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError(status, err.to_string())
    }
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    ApiError(status, msg.into())
}

pub type ApiResult<T> = Result<T, ApiError>;

fn path_id(path: Result<Path<i64>, PathRejection>) -> ApiResult<i64> {
    path.map(|Path(id)| id)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "invalid id"))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| api_error(rejection.status(), rejection.body_text()))
}

fn deleted() -> Json<serde_json::Value> {
    Json(json!({ "status": "deleted" }))
}

// ─── GET /health ─────────────────────────────────────────────────

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(state.health()).into_response()
}

// ─── Owners ──────────────────────────────────────────────────────

pub async fn list_owners(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let owners = owners::list_owners(&state.db().lock(), PAGE_LIMIT)?;
    Ok(Json(owners).into_response())
}

pub async fn create_owner(
    State(state): State<Arc<AppState>>,
    body: Result<Json<OwnerInput>, JsonRejection>,
) -> ApiResult<Response> {
    let input = json_body(body)?;
    let owner = owners::create_owner(&state.db().lock(), &input)?;
    Ok((StatusCode::CREATED, Json(owner)).into_response())
}

pub async fn get_owner(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let id = path_id(path)?;
    let owner = owners::owner_by_id(&state.db().lock(), id)?;
    Ok(Json(owner).into_response())
}

pub async fn update_owner(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    body: Result<Json<OwnerInput>, JsonRejection>,
) -> ApiResult<Response> {
    let id = path_id(path)?;
    let input = json_body(body)?;
    let owner = owners::update_owner(&state.db().lock(), id, &input)?;
    Ok(Json(owner).into_response())
}

pub async fn delete_owner(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let id = path_id(path)?;
    owners::delete_owner(&state.db().lock(), id)?;
    Ok(deleted().into_response())
}

pub async fn owner_companies(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let id = path_id(path)?;
    let conn = state.db().lock();
    owners::owner_by_id(&conn, id)?;
    let companies = companies::companies_for_owner(&conn, id)?;
    Ok(Json(companies).into_response())
}

// ─── Companies ───────────────────────────────────────────────────

pub async fn list_companies(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let companies = companies::list_recent_companies(&state.db().lock(), PAGE_LIMIT)?;
    Ok(Json(companies).into_response())
}

pub async fn create_company(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewCompany>, JsonRejection>,
) -> ApiResult<Response> {
    let input = json_body(body)?;
    let company = companies::create_company(&state.db().lock(), &input)?;
    Ok((StatusCode::CREATED, Json(company)).into_response())
}

pub async fn get_company(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let id = path_id(path)?;
    let company = companies::company_by_id(&state.db().lock(), id)?;
    Ok(Json(company).into_response())
}

pub async fn update_company(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    body: Result<Json<CompanyUpdate>, JsonRejection>,
) -> ApiResult<Response> {
    let id = path_id(path)?;
    let update = json_body(body)?;
    let company = companies::update_company(&state.db().lock(), id, &update)?;
    Ok(Json(company).into_response())
}

pub async fn delete_company(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let id = path_id(path)?;
    companies::delete_company(&state.db().lock(), id)?;
    Ok(deleted().into_response())
}

// ─── GET /geo/company/{id} ───────────────────────────────────────

#[derive(Serialize)]
struct CoordinatesResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<String>,
    address: String,
}

/// 200 with coordinates once resolved, otherwise 202 with the address only.
pub async fn company_coordinates(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Response> {
    let id = path_id(path)?;
    let company = companies::company_by_id(&state.db().lock(), id)?;
    let view = state.coordinator().get_or_trigger(
        company.id,
        &company.city,
        &company.address,
        &company.name,
    )?;

    let address = company.display_address();
    let response = match view.resolved_coordinates() {
        Some(coordinates) => (
            StatusCode::OK,
            Json(CoordinatesResponse {
                latitude: Some(coordinates.latitude_text()),
                longitude: Some(coordinates.longitude_text()),
                address,
            }),
        ),
        None => (
            StatusCode::ACCEPTED,
            Json(CoordinatesResponse {
                latitude: None,
                longitude: None,
                address,
            }),
        ),
    };
    Ok(response.into_response())
}

// ─── GET /geo/companies ──────────────────────────────────────────

#[derive(Serialize)]
struct BatchItem {
    id: i64,
    name: String,
    city: String,
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<String>,
}

impl From<ListingItem> for BatchItem {
    fn from(item: ListingItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            city: item.city,
            address: item.address,
            latitude: item.coordinates.map(|c| c.latitude_text()),
            longitude: item.coordinates.map(|c| c.longitude_text()),
        }
    }
}

/// 200 when every item is resolved, 206 when some are not. Never triggers resolution.
pub async fn companies_coordinates(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let listing = state.listing();
    let companies = companies::list_recent_companies(&state.db().lock(), listing.limit())?;
    let view = listing.build(&companies)?;
    if view.items.is_empty() {
        return Err(api_error(StatusCode::NOT_FOUND, "companies not found"));
    }

    let status = if view.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let items: Vec<BatchItem> = view.items.into_iter().map(BatchItem::from).collect();
    Ok((status, Json(items)).into_response())
}
