use crate::handlers::common::{created_response, map_service_error, success_response};
use crate::handlers::SessionId;
use crate::{
    entities::{OrderStatus, PaymentMethod, PaymentStatus},
    errors::{ApiError, ServiceError},
    services::checkout::{CheckoutForm, CheckoutOutcome},
    AppState,
};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new().route("/checkout", get(checkout_summary).post(place_order))
}

#[derive(Debug, Serialize)]
pub struct PlacedOrderResponse {
    pub order_number: String,
    pub order_status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub total: Decimal,
    pub next: String,
}

impl From<CheckoutOutcome> for PlacedOrderResponse {
    fn from(outcome: CheckoutOutcome) -> Self {
        Self {
            next: outcome.next.location(),
            order_number: outcome.order.order_number.clone(),
            order_status: outcome.order.status,
            payment_method: outcome.payment.method,
            payment_status: outcome.payment.status,
            subtotal: outcome.order.subtotal(),
            shipping_fee: outcome.order.shipping_fee(),
            total: outcome.order.total(),
        }
    }
}

async fn checkout_summary(
    State(state): State<Arc<AppState>>,
    session: SessionId,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.carts.load(&session);
    if cart.is_empty() {
        return Err(map_service_error(ServiceError::EmptyCart));
    }

    let summary = state
        .services
        .checkout
        .summary(&cart)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(summary))
}

async fn place_order(
    State(state): State<Arc<AppState>>,
    session: SessionId,
    Json(form): Json<CheckoutForm>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cart = state.carts.load(&session);
    let result = state.services.checkout.place_order(&mut cart, form).await;
    state.carts.store(&session, cart);

    let outcome = result.map_err(map_service_error)?;
    Ok(created_response(PlacedOrderResponse::from(outcome)))
}
