use crate::handlers::common::{map_service_error, success_response};
use crate::handlers::SessionId;
use crate::{
    entities::{OrderStatus, PaymentMethod, PaymentStatus},
    errors::ApiError,
    services::payments::{PaymentTransition, ProviderCallback},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Creates the router for payment endpoints
pub fn payment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payments/momo/:order_number/start", post(start_mobile_money))
        .route("/payments/:order_number/callback", post(provider_callback))
        .route("/payments/:order_number/cancel", post(cancel_payment))
        .route("/payments/:order_number/collect", post(record_cash_collected))
        .route("/payments/:order_number/fail", post(mark_failed))
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub order_number: String,
    pub order_status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub provider_reference: Option<String>,
    pub changed: bool,
    pub next: String,
}

impl From<PaymentTransition> for PaymentResponse {
    fn from(transition: PaymentTransition) -> Self {
        Self {
            next: format!("/api/v1/orders/{}/success", transition.order.order_number),
            order_number: transition.order.order_number,
            order_status: transition.order.status,
            payment_method: transition.payment.method,
            payment_status: transition.payment.status,
            provider_reference: transition.payment.provider_reference,
            changed: transition.changed,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FailPaymentRequest {
    pub reason: String,
}

/// Starts mobile money. Repeating the call on a paid order changes nothing.
async fn start_mobile_money(
    State(state): State<Arc<AppState>>,
    session: Option<SessionId>,
    Path(order_number): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let transition = match session {
        Some(session) => {
            let mut cart = state.carts.load(&session);
            let result = state
                .services
                .checkout
                .start_payment(&order_number, &mut cart)
                .await;
            state.carts.store(&session, cart);
            result
        }
        None => state.services.payments.start(&order_number).await,
    }
    .map_err(map_service_error)?;

    Ok(success_response(PaymentResponse::from(transition)))
}

async fn provider_callback(
    State(state): State<Arc<AppState>>,
    Path(order_number): Path<String>,
    Json(callback): Json<ProviderCallback>,
) -> Result<impl IntoResponse, ApiError> {
    let transition = state
        .services
        .payments
        .reconcile(&order_number, callback)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(PaymentResponse::from(transition)))
}

async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    Path(order_number): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let transition = state
        .services
        .payments
        .cancel(&order_number)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(PaymentResponse::from(transition)))
}

async fn record_cash_collected(
    State(state): State<Arc<AppState>>,
    Path(order_number): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let transition = state
        .services
        .payments
        .record_cash_collected(&order_number)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(PaymentResponse::from(transition)))
}

async fn mark_failed(
    State(state): State<Arc<AppState>>,
    Path(order_number): Path<String>,
    Json(body): Json<FailPaymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.reason.trim().is_empty() {
        return Err(ApiError::ValidationError("reason is required".into()));
    }
    let transition = state
        .services
        .payments
        .mark_failed(&order_number, body.reason.trim())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(PaymentResponse::from(transition)))
}
