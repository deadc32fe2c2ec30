pub mod cart;
pub mod checkout;
pub mod common;
pub mod inventory;
pub mod orders;
pub mod payments;

use crate::{
    config::AppConfig,
    errors::ApiError,
    events::EventSender,
    notifications::{Mailer, NotificationDispatcher, SmsGateway},
    services::{
        cart::{CartService, CartState},
        checkout::CheckoutService,
        inventory::InventoryService,
        order_numbers::{OrderNumberGenerator, TimestampSequenceGenerator},
        orders::OrderService,
        payments::{PaymentProviders, PaymentService},
    },
    AppState,
};
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts, Router};
use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the caller's cart session.
pub const SESSION_HEADER: &str = "x-session-id";

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppServices {
    pub cart: CartService,
    pub checkout: CheckoutService,
    pub payments: PaymentService,
    pub orders: OrderService,
    pub inventory: InventoryService,
}

/// Collaborators that differ between production and tests.
pub struct ServiceDeps {
    pub mailer: Arc<dyn Mailer>,
    pub sms: Arc<dyn SmsGateway>,
    pub providers: PaymentProviders,
    pub order_numbers: Arc<dyn OrderNumberGenerator>,
    pub provider_timeout: Duration,
}

impl ServiceDeps {
    /// Simulated payment rails and timestamped order numbers from `cfg`.
    pub fn simulated(cfg: &AppConfig, mailer: Arc<dyn Mailer>, sms: Arc<dyn SmsGateway>) -> Self {
        Self {
            mailer,
            sms,
            providers: PaymentProviders::simulated(),
            order_numbers: Arc::new(TimestampSequenceGenerator::new(
                cfg.order_number_prefix.clone(),
            )),
            provider_timeout: cfg.payment_provider_timeout(),
        }
    }
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        cfg: &AppConfig,
        deps: ServiceDeps,
    ) -> Self {
        let notifier = NotificationDispatcher::from_config(cfg, deps.mailer, deps.sms);
        let cart = CartService::new(db.clone(), event_sender.clone());
        let payments = PaymentService::new(
            db.clone(),
            deps.providers,
            event_sender.clone(),
            notifier.clone(),
            deps.provider_timeout,
        );
        let checkout = CheckoutService::new(
            db.clone(),
            cart.clone(),
            payments.clone(),
            notifier,
            deps.order_numbers,
            event_sender.clone(),
            cfg.order_number_max_attempts,
        );

        Self {
            cart,
            checkout,
            payments,
            orders: OrderService::new(db.clone()),
            inventory: InventoryService::new(db, event_sender),
        }
    }
}

/// In-memory cart storage keyed by session id.
#[derive(Debug, Default, Clone)]
pub struct CartSessions {
    carts: Arc<DashMap<String, CartState>>,
}

impl CartSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the session's cart; empty for unknown sessions.
    pub fn load(&self, session: &SessionId) -> CartState {
        self.carts
            .get(session.as_str())
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Stores the cart, dropping the entry entirely once it is empty.
    pub fn store(&self, session: &SessionId, cart: CartState) {
        if cart.is_empty() {
            self.carts.remove(session.as_str());
        } else {
            self.carts.insert(session.as_str().to_string(), cart);
        }
    }
}

/// Session id taken from the `x-session-id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .ok_or_else(|| {
                ApiError::BadRequest(format!("missing or invalid {} header", SESSION_HEADER))
            })?;
        Ok(SessionId(value.to_string()))
    }
}

/// Every `/api/v1` route.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(cart::cart_routes())
        .merge(checkout::checkout_routes())
        .merge(payments::payment_routes())
        .merge(orders::order_routes())
        .merge(inventory::inventory_routes())
}
