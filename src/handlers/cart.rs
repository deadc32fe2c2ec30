use crate::handlers::common::{map_service_error, success_response};
use crate::handlers::SessionId;
use crate::{
    errors::ApiError,
    services::cart::{AddOutcome, CartSnapshot, CartState, DecreaseOutcome},
    AppState,
};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Creates the router for cart endpoints
pub fn cart_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/cart", get(view_cart))
        .route("/cart/items/:book_id/add", post(add_item))
        .route("/cart/items/:book_id/decrease", post(decrease_item))
        .route("/cart/items/:book_id", delete(remove_item))
        .route("/cart/clear", post(clear_cart))
}

#[derive(Debug, Serialize)]
pub struct CartLineView {
    pub book_id: Uuid,
    pub title: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub line_total: Decimal,
    pub stock: i32,
}

#[derive(Debug, Serialize)]
pub struct CartView {
    pub lines: Vec<CartLineView>,
    pub subtotal: Decimal,
    pub item_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl CartView {
    fn from_snapshot(snapshot: &CartSnapshot, notice: Option<String>) -> Self {
        Self {
            lines: snapshot
                .iter()
                .map(|line| CartLineView {
                    book_id: line.book.id,
                    title: line.book.title.clone(),
                    unit_price: line.book.price(),
                    quantity: line.quantity,
                    line_total: line.line_total,
                    stock: line.book.stock,
                })
                .collect(),
            subtotal: snapshot.subtotal(),
            item_count: snapshot.item_count(),
            notice,
        }
    }
}

async fn render(
    state: &AppState,
    cart: &CartState,
    notice: Option<String>,
) -> Result<CartView, ApiError> {
    let snapshot = state
        .services
        .cart
        .snapshot(cart)
        .await
        .map_err(map_service_error)?;
    Ok(CartView::from_snapshot(&snapshot, notice))
}

async fn view_cart(
    State(state): State<Arc<AppState>>,
    session: SessionId,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.carts.load(&session);
    Ok(success_response(render(&state, &cart, None).await?))
}

async fn add_item(
    State(state): State<Arc<AppState>>,
    session: SessionId,
    Path(book_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cart = state.carts.load(&session);
    let outcome = state
        .services
        .cart
        .add(&mut cart, book_id)
        .await
        .map_err(map_service_error)?;
    state.carts.store(&session, cart.clone());

    let notice = match outcome {
        AddOutcome::Added { title, quantity } => {
            format!("Added to cart: {} (x{}).", title, quantity)
        }
        AddOutcome::AtMaximum { stock } => format!(
            "You already have the maximum available quantity ({}) of this title in your cart.",
            stock
        ),
    };
    Ok(success_response(render(&state, &cart, Some(notice)).await?))
}

async fn decrease_item(
    State(state): State<Arc<AppState>>,
    session: SessionId,
    Path(book_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cart = state.carts.load(&session);
    let notice = match cart.decrease(book_id) {
        DecreaseOutcome::Decreased { quantity } => Some(format!("Updated quantity to {}.", quantity)),
        DecreaseOutcome::Removed => Some("Item removed from cart.".to_string()),
        DecreaseOutcome::NotInCart => None,
    };
    state.carts.store(&session, cart.clone());
    Ok(success_response(render(&state, &cart, notice).await?))
}

async fn remove_item(
    State(state): State<Arc<AppState>>,
    session: SessionId,
    Path(book_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cart = state.carts.load(&session);
    let notice = cart
        .remove(book_id)
        .then(|| "Item removed from cart.".to_string());
    state.carts.store(&session, cart.clone());
    Ok(success_response(render(&state, &cart, notice).await?))
}

async fn clear_cart(
    State(state): State<Arc<AppState>>,
    session: SessionId,
) -> Result<impl IntoResponse, ApiError> {
    let mut cart = state.carts.load(&session);
    state.services.cart.clear(&mut cart, None).await;
    state.carts.store(&session, cart.clone());
    Ok(success_response(
        render(&state, &cart, Some("Cart cleared.".to_string())).await?,
    ))
}
