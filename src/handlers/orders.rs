use crate::handlers::common::{map_service_error, success_response};
use crate::{errors::ApiError, AppState};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::sync::Arc;

/// Creates the router for order endpoints
pub fn order_routes() -> Router<Arc<AppState>> {
    Router::new().route("/orders/:order_number/success", get(order_success))
}

/// Read-only confirmation: order, lines and payment.
async fn order_success(
    State(state): State<Arc<AppState>>,
    Path(order_number): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state
        .services
        .orders
        .find_by_number(&order_number)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(details))
}
