//! HTTP endpoints for driver devices and rider apps.
//!
//! ## Endpoints
//!
//! - `GET /api/location/update` - position report as query string
//! - `POST /api/location/update` - position report as form body
//! - `POST /api/location` - position report as JSON
//! - `POST /api/location/delete` - remove one vehicle
//! - `GET /api/vehicles` - fleet snapshot with ETAs
//! - `GET /api/vehicles/{id}` - single vehicle with ETA
//! - `POST /api/tracking/start`, `POST /api/tracking/stop` - tracking session
//! - `GET /api/tracking/{id}` - tracking status
//! - `POST /api/admin/clear` - drop every vehicle

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Form, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{AuthGate, Credentials};
use crate::error::RegistryError;
use crate::models::{
    CoordinateInput, FleetEntry, ListFilter, PositionReport, TrackingStatus, VehicleRecord,
};
use crate::proximity::Coordinate;
use crate::service::FleetService;

const API_KEY_HEADER: &str = "x-api-key";

/// Which vehicles the public fleet listing may show
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingPolicy {
    /// Restrict the listing to vehicles with an active tracking session
    pub require_tracking: bool,
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    service: FleetService,
    auth: Arc<dyn AuthGate>,
    policy: ListingPolicy,
}

impl AppState {
    pub fn new(service: FleetService, auth: Arc<dyn AuthGate>, policy: ListingPolicy) -> Self {
        Self {
            service,
            auth,
            policy,
        }
    }

    fn authorize(&self, headers: &HeaderMap, field: Option<&str>) -> ApiResult<()> {
        let api_key = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .or(field)
            .map(str::to_string);

        if self.auth.check(&Credentials { api_key }) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/api/location/update", get(update_query).post(update_form))
        .route("/api/location", post(update_json))
        .route("/api/location/delete", post(delete_vehicle))
        .route("/api/vehicles", get(list_vehicles))
        .route("/api/vehicles/{id}", get(get_vehicle))
        .route("/api/tracking/start", post(start_tracking))
        .route("/api/tracking/stop", post(stop_tracking))
        .route("/api/tracking/{id}", get(tracking_status))
        .route("/api/admin/clear", post(clear_all))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// JSON body that could not be read into the expected shape
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("missing or invalid API key")]
    Unauthorized,
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::MalformedBody(rejection.body_text())
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Registry(RegistryError::Validation { .. }) | Self::MalformedBody(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Registry(RegistryError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Registry(RegistryError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Registry(RegistryError::Validation { .. }) | Self::MalformedBody(_) => {
                "VALIDATION_ERROR"
            }
            Self::Registry(RegistryError::NotFound { .. }) => "NOT_FOUND",
            Self::Registry(RegistryError::RateLimited { .. }) => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ApiError::Registry(RegistryError::Validation { .. })
            | ApiError::MalformedBody(_)
            | ApiError::Unauthorized => {
                tracing::warn!(error = %self, "Rejected request");
            }
            _ => tracing::debug!(error = %self, "Request failed"),
        }

        let field = match &self {
            ApiError::Registry(RegistryError::Validation { field, .. }) => {
                Some(field.to_string())
            }
            _ => None,
        };

        let retry_after = match &self {
            ApiError::Registry(RegistryError::RateLimited { retry_after, .. }) => {
                // Whole seconds, rounded up so clients never retry early
                let secs = retry_after.as_millis().div_ceil(1000).max(1);
                HeaderValue::from_str(&secs.to_string()).ok()
            }
            _ => None,
        };

        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.to_string(),
            field,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Position report fields as they arrive in a query string or form
#[derive(Debug, Default, Deserialize)]
pub struct UpdateParams {
    pub id: Option<String>,
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub mode: Option<String>,
    pub route_id: Option<String>,
    pub sharing: Option<String>,
    pub role: Option<String>,
    pub api_key: Option<String>,
}

impl UpdateParams {
    fn into_report(self) -> PositionReport {
        PositionReport {
            id: self.id,
            lat: self.lat.map(CoordinateInput::Text),
            lon: self.lon.map(CoordinateInput::Text),
            mode: self.mode,
            route_id: self.route_id,
            sharing: self.sharing.as_deref().and_then(parse_flag),
            role: self.role,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonUpdate {
    #[serde(flatten)]
    pub report: PositionReport,
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IdRequest {
    pub id: Option<String>,
    pub api_key: Option<String>,
}

impl IdRequest {
    fn id(&self) -> ApiResult<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RegistryError::validation("id", "vehicle id is required").into())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FleetParams {
    pub route_id: Option<String>,
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub sharing: Option<String>,
    pub tracking: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RiderParams {
    pub lat: Option<String>,
    pub lon: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyParams {
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub removed: usize,
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Rider position from optional query fields; both or neither must be set
fn rider_position(lat: Option<String>, lon: Option<String>) -> ApiResult<Option<Coordinate>> {
    match (lat, lon) {
        (None, None) => Ok(None),
        (Some(lat), Some(lon)) => {
            let lat = CoordinateInput::Text(lat).parse("lat")?;
            let lon = CoordinateInput::Text(lon).parse("lon")?;
            Ok(Some(Coordinate::new(lat, lon)))
        }
        (None, Some(_)) => {
            Err(RegistryError::validation("lat", "lat and lon must be given together").into())
        }
        (Some(_), None) => {
            Err(RegistryError::validation("lon", "lat and lon must be given together").into())
        }
    }
}

async fn home() -> &'static str {
    "Public transport tracker backend is running"
}

async fn health() -> &'static str {
    "OK"
}

fn report(
    state: &AppState,
    headers: &HeaderMap,
    api_key: Option<&str>,
    report: PositionReport,
) -> ApiResult<Json<VehicleRecord>> {
    state.authorize(headers, api_key)?;
    let record = state.service.report_position(report)?;
    Ok(Json(record))
}

async fn update_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UpdateParams>,
) -> ApiResult<Json<VehicleRecord>> {
    let api_key = params.api_key.clone();
    report(&state, &headers, api_key.as_deref(), params.into_report())
}

async fn update_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<UpdateParams>,
) -> ApiResult<Json<VehicleRecord>> {
    let api_key = params.api_key.clone();
    report(&state, &headers, api_key.as_deref(), params.into_report())
}

async fn update_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<JsonUpdate>, JsonRejection>,
) -> ApiResult<Json<VehicleRecord>> {
    let Json(body) = body?;
    report(&state, &headers, body.api_key.as_deref(), body.report)
}

async fn delete_vehicle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IdRequest>, JsonRejection>,
) -> ApiResult<Json<VehicleRecord>> {
    let Json(body) = body?;
    state.authorize(&headers, body.api_key.as_deref())?;
    let record = state.service.remove(body.id()?)?;
    Ok(Json(record))
}

async fn list_vehicles(
    State(state): State<AppState>,
    Query(params): Query<FleetParams>,
) -> ApiResult<Json<Vec<FleetEntry>>> {
    let rider = rider_position(params.lat, params.lon)?;
    let filter = ListFilter {
        tracking_only: state.policy.require_tracking
            || params.tracking.as_deref().and_then(parse_flag) == Some(true),
        route_id: params.route_id.filter(|route| !route.trim().is_empty()),
        sharing_only: params.sharing.as_deref().and_then(parse_flag) == Some(true),
    };

    Ok(Json(state.service.fleet(&filter, rider)))
}

async fn get_vehicle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RiderParams>,
) -> ApiResult<Json<FleetEntry>> {
    let rider = rider_position(params.lat, params.lon)?;
    Ok(Json(state.service.vehicle(&id, rider)?))
}

async fn start_tracking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(body): Form<IdRequest>,
) -> ApiResult<Json<TrackingStatus>> {
    state.authorize(&headers, body.api_key.as_deref())?;
    Ok(Json(state.service.start_tracking(body.id()?)?))
}

async fn stop_tracking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(body): Form<IdRequest>,
) -> ApiResult<Json<TrackingStatus>> {
    state.authorize(&headers, body.api_key.as_deref())?;
    Ok(Json(state.service.stop_tracking(body.id()?)?))
}

async fn tracking_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<TrackingStatus> {
    Json(state.service.tracking_status(&id))
}

async fn clear_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<KeyParams>,
) -> ApiResult<Json<ClearResponse>> {
    state.authorize(&headers, params.api_key.as_deref())?;
    let removed = state.service.clear_all().await;
    Ok(Json(ClearResponse { removed }))
}
