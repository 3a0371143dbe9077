//! Thin HTTP adapter over the reservation service. Transport concerns stop
//! here; everything interesting happens in `service`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InventoryError;
use crate::service::InventoryService;
use crate::store::InventoryStore;

pub struct AppState<S: InventoryStore> {
    pub service: Arc<InventoryService<S>>,
    pub default_ttl: Duration,
}

impl<S: InventoryStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            default_ttl: self.default_ttl,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub product_id: String,
    pub order_id: String,
    pub quantity: i32,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    pub reservation_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct AddStockRequest {
    pub product_id: String,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct StockResponse {
    pub product_id: String,
    pub available: i32,
    pub reserved: i32,
    pub total: i32,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn create_router<S: InventoryStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/reservations", post(create_reservation::<S>))
        .route("/reservations/:id/release", post(release_reservation::<S>))
        .route("/reservations/:id/commit", post(commit_reservation::<S>))
        .route("/stock", post(add_stock::<S>))
        .route("/stock/:product_id", get(get_stock::<S>))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn error_response(e: InventoryError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        InventoryError::InsufficientStock { .. }
        | InventoryError::DuplicateReservation { .. }
        | InventoryError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
        InventoryError::LockAcquisitionTimeout { .. }
        | InventoryError::LockServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InventoryError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
        InventoryError::ReservationNotFound(_) | InventoryError::ProductNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        InventoryError::Publish(_) | InventoryError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

pub async fn create_reservation<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<ReserveResponse>), (StatusCode, Json<ErrorResponse>)> {
    let ttl = request
        .ttl_seconds
        .map(Duration::from_secs)
        .unwrap_or(state.default_ttl);
    match state
        .service
        .reserve(&request.product_id, &request.order_id, request.quantity, ttl)
        .await
    {
        Ok(reservation_id) => Ok((StatusCode::CREATED, Json(ReserveResponse { reservation_id }))),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn release_reservation<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .release(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

pub async fn commit_reservation<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .commit(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

pub async fn add_stock<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<AddStockRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .add_stock(&request.product_id, request.quantity)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

pub async fn get_stock<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Path(product_id): Path<String>,
) -> Result<Json<StockResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.service.get_stock(&product_id).await {
        Ok(levels) => Ok(Json(StockResponse {
            product_id,
            available: levels.available,
            reserved: levels.reserved,
            total: levels.total,
        })),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
