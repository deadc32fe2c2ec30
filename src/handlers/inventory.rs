use crate::handlers::common::{map_service_error, success_response};
use crate::{errors::ApiError, AppState};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Operator stock adjustments.
pub fn inventory_routes() -> Router<Arc<AppState>> {
    Router::new().route("/inventory/:book_id/release", post(release_stock))
}

#[derive(Debug, Deserialize)]
pub struct StockRequest {
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct StockResponse {
    pub book_id: Uuid,
    pub stock: i32,
}

async fn release_stock(
    State(state): State<Arc<AppState>>,
    Path(book_id): Path<Uuid>,
    Json(body): Json<StockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stock = state
        .services
        .inventory
        .release(book_id, body.quantity)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(StockResponse { book_id, stock }))
}
