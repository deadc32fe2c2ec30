use crate::{
    entities::{order, order_line, payment, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::NotificationDispatcher,
};
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What a provider needs to collect money for an order.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_number: String,
    pub amount: Decimal,
    pub phone: String,
}

/// The state a provider reports after acting on a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutcome {
    pub status: PaymentStatus,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Paid,
    Failed,
    Cancelled,
}

impl From<CallbackStatus> for PaymentStatus {
    fn from(status: CallbackStatus) -> Self {
        match status {
            CallbackStatus::Paid => PaymentStatus::Paid,
            CallbackStatus::Failed => PaymentStatus::Failed,
            CallbackStatus::Cancelled => PaymentStatus::Cancelled,
        }
    }
}

/// An asynchronous status report from a payment provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallback {
    pub status: CallbackStatus,
    #[serde(default)]
    pub reference: Option<String>,
}

/// A payment rail. Each method of payment is backed by exactly one provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Stored in `payments.provider`.
    fn name(&self) -> &str;

    async fn initiate(&self, request: &PaymentRequest) -> Result<ProviderOutcome, ServiceError>;

    async fn reconcile(
        &self,
        order_number: &str,
        callback: &ProviderCallback,
    ) -> Result<ProviderOutcome, ServiceError>;

    async fn cancel(&self, order_number: &str, reference: Option<&str>) -> Result<(), ServiceError>;
}

/// Money changes hands at the door; initiating only authorizes.
#[derive(Debug, Default, Clone)]
pub struct CashOnDelivery;

#[async_trait]
impl PaymentProvider for CashOnDelivery {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::CashOnDelivery
    }

    fn name(&self) -> &str {
        "cod"
    }

    async fn initiate(&self, _request: &PaymentRequest) -> Result<ProviderOutcome, ServiceError> {
        Ok(ProviderOutcome {
            status: PaymentStatus::Authorized,
            reference: None,
        })
    }

    async fn reconcile(
        &self,
        _order_number: &str,
        callback: &ProviderCallback,
    ) -> Result<ProviderOutcome, ServiceError> {
        Ok(ProviderOutcome {
            status: callback.status.into(),
            reference: callback.reference.clone(),
        })
    }

    async fn cancel(&self, _order_number: &str, _reference: Option<&str>) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Simulated mobile-money rail that approves every request immediately.
#[derive(Debug, Default, Clone)]
pub struct MobileMoney;

#[async_trait]
impl PaymentProvider for MobileMoney {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::MobileMoney
    }

    fn name(&self) -> &str {
        "mtn-voda-at"
    }

    async fn initiate(&self, request: &PaymentRequest) -> Result<ProviderOutcome, ServiceError> {
        Ok(ProviderOutcome {
            status: PaymentStatus::Paid,
            reference: Some(format!("SIM-{}", request.order_number)),
        })
    }

    async fn reconcile(
        &self,
        order_number: &str,
        callback: &ProviderCallback,
    ) -> Result<ProviderOutcome, ServiceError> {
        Ok(ProviderOutcome {
            status: callback.status.into(),
            reference: callback
                .reference
                .clone()
                .or_else(|| Some(format!("SIM-{}", order_number))),
        })
    }

    async fn cancel(&self, _order_number: &str, _reference: Option<&str>) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// One provider per payment method.
#[derive(Clone)]
pub struct PaymentProviders {
    cash_on_delivery: Arc<dyn PaymentProvider>,
    mobile_money: Arc<dyn PaymentProvider>,
}

impl PaymentProviders {
    pub fn new(
        cash_on_delivery: Arc<dyn PaymentProvider>,
        mobile_money: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            cash_on_delivery,
            mobile_money,
        }
    }

    pub fn simulated() -> Self {
        Self::new(Arc::new(CashOnDelivery), Arc::new(MobileMoney))
    }

    pub fn for_method(&self, method: PaymentMethod) -> &Arc<dyn PaymentProvider> {
        match method {
            PaymentMethod::CashOnDelivery => &self.cash_on_delivery,
            PaymentMethod::MobileMoney => &self.mobile_money,
        }
    }
}

/// Result of driving a payment. `changed` is false when the request was a no-op.
#[derive(Debug, Clone)]
pub struct PaymentTransition {
    pub order: order::Model,
    pub payment: payment::Model,
    pub changed: bool,
}

/// Owns every change to a payment's status after checkout.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    providers: PaymentProviders,
    event_sender: Arc<EventSender>,
    notifier: NotificationDispatcher,
    provider_timeout: Duration,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        providers: PaymentProviders,
        event_sender: Arc<EventSender>,
        notifier: NotificationDispatcher,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            db,
            providers,
            event_sender,
            notifier,
            provider_timeout,
        }
    }

    pub fn provider(&self, method: PaymentMethod) -> &Arc<dyn PaymentProvider> {
        self.providers.for_method(method)
    }

    /// Status a freshly placed order's payment starts in.
    ///
    /// Cash on delivery is authorized by its provider on the spot. Mobile money
    /// waits for `start`, so its provider is not contacted here.
    pub async fn opening_outcome(
        &self,
        method: PaymentMethod,
        request: &PaymentRequest,
    ) -> Result<ProviderOutcome, ServiceError> {
        match method {
            PaymentMethod::CashOnDelivery => {
                let provider = self.provider(method).clone();
                self.bounded(provider.initiate(request)).await
            }
            PaymentMethod::MobileMoney => Ok(ProviderOutcome {
                status: PaymentStatus::Pending,
                reference: None,
            }),
        }
    }

    /// Drives a mobile-money payment to completion.
    ///
    /// Creates a pending payment if the order has none. A payment that is not
    /// pending is returned as is without contacting the provider.
    #[instrument(skip(self))]
    pub async fn start(&self, order_number: &str) -> Result<PaymentTransition, ServiceError> {
        let order = self.find_order(order_number).await?;
        let payment = match self.find_payment(order.id).await? {
            Some(payment) => payment,
            None => self.create_pending_momo(&order).await?,
        };

        if payment.method != PaymentMethod::MobileMoney || payment.status != PaymentStatus::Pending {
            info!(
                order_number = %order_number,
                status = payment.status.as_str(),
                "Payment start ignored; payment is not pending mobile money"
            );
            return Ok(PaymentTransition {
                order,
                payment,
                changed: false,
            });
        }

        let request = PaymentRequest {
            order_number: order.order_number.clone(),
            amount: order.total(),
            phone: order.phone.clone(),
        };
        let provider = self.provider(PaymentMethod::MobileMoney).clone();
        let outcome = self.bounded(provider.initiate(&request)).await?;

        if outcome.status == PaymentStatus::Failed {
            self.apply(order, payment, PaymentStatus::Failed, outcome.reference)
                .await?;
            return Err(ServiceError::PaymentFailed(format!(
                "Mobile money payment for order {} was declined",
                order_number
            )));
        }

        self.apply(order, payment, outcome.status, outcome.reference)
            .await
    }

    /// Applies a provider callback. Stale or illegal reports are ignored.
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        order_number: &str,
        callback: ProviderCallback,
    ) -> Result<PaymentTransition, ServiceError> {
        let (order, payment) = self.find_order_with_payment(order_number).await?;
        let provider = self.provider(payment.method).clone();
        let outcome = self
            .bounded(provider.reconcile(order_number, &callback))
            .await?;

        self.apply(order, payment, outcome.status, outcome.reference)
            .await
    }

    /// Marks a cash-on-delivery payment as collected.
    #[instrument(skip(self))]
    pub async fn record_cash_collected(
        &self,
        order_number: &str,
    ) -> Result<PaymentTransition, ServiceError> {
        let (order, payment) = self.find_order_with_payment(order_number).await?;
        if payment.method != PaymentMethod::CashOnDelivery {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is not a cash on delivery order",
                order_number
            )));
        }
        self.apply(order, payment, PaymentStatus::Paid, None).await
    }

    /// Operator cancel. Terminal payments are left alone.
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_number: &str) -> Result<PaymentTransition, ServiceError> {
        let (order, payment) = self.find_order_with_payment(order_number).await?;
        if !payment.status.can_transition_to(PaymentStatus::Cancelled) {
            return Ok(PaymentTransition {
                order,
                payment,
                changed: false,
            });
        }

        let provider = self.provider(payment.method).clone();
        self.bounded(provider.cancel(order_number, payment.provider_reference.as_deref()))
            .await?;
        self.apply(order, payment, PaymentStatus::Cancelled, None)
            .await
    }

    /// Operator action for a payment that will never complete.
    #[instrument(skip(self))]
    pub async fn mark_failed(
        &self,
        order_number: &str,
        reason: &str,
    ) -> Result<PaymentTransition, ServiceError> {
        let (order, payment) = self.find_order_with_payment(order_number).await?;
        warn!(order_number = %order_number, reason = %reason, "Marking payment failed");
        self.apply(order, payment, PaymentStatus::Failed, None).await
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        match tokio::time::timeout(self.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.provider_timeout, "Payment provider call timed out");
                Err(ServiceError::PaymentProviderUnavailable(format!(
                    "no response within {}s",
                    self.provider_timeout.as_secs_f64()
                )))
            }
        }
    }

    async fn find_order(&self, order_number: &str) -> Result<order::Model, ServiceError> {
        order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }

    async fn find_payment(&self, order_id: Uuid) -> Result<Option<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await?)
    }

    async fn find_order_with_payment(
        &self,
        order_number: &str,
    ) -> Result<(order::Model, payment::Model), ServiceError> {
        let order = self.find_order(order_number).await?;
        let payment = self.find_payment(order.id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("No payment recorded for order {}", order_number))
        })?;
        Ok((order, payment))
    }

    async fn create_pending_momo(&self, order: &order::Model) -> Result<payment::Model, ServiceError> {
        let now = Utc::now();
        let provider = self.provider(PaymentMethod::MobileMoney);
        let model = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            method: Set(PaymentMethod::MobileMoney),
            provider: Set(provider.name().to_string()),
            status: Set(PaymentStatus::Pending),
            amount_minor: Set(order.total_minor),
            provider_reference: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(&*self.db).await {
            Ok(created) => {
                info!(order_number = %order.order_number, "Created pending mobile money payment");
                Ok(created)
            }
            // Lost a race with a concurrent start; use the winner's row.
            Err(e) if crate::db::is_unique_violation(&e) => self
                .find_payment(order.id)
                .await?
                .ok_or(ServiceError::DatabaseError(e)),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves `payment` to `to` if the edge is legal and nobody moved it first.
    async fn apply(
        &self,
        mut order: order::Model,
        mut payment: payment::Model,
        to: PaymentStatus,
        reference: Option<String>,
    ) -> Result<PaymentTransition, ServiceError> {
        let from = payment.status;
        if !from.can_transition_to(to) {
            info!(
                order_number = %order.order_number,
                from = from.as_str(),
                to = to.as_str(),
                "Ignoring illegal payment transition"
            );
            return Ok(PaymentTransition {
                order,
                payment,
                changed: false,
            });
        }

        let now = Utc::now();
        let reference = reference.or_else(|| payment.provider_reference.clone());
        let next_order_status = match to {
            PaymentStatus::Paid if order.status == OrderStatus::New => Some(OrderStatus::Paid),
            PaymentStatus::Cancelled if order.status == OrderStatus::New => {
                Some(OrderStatus::Cancelled)
            }
            _ => None,
        };

        let txn = self.db.begin().await?;
        let updated = payment::Entity::update_many()
            .set(payment::ActiveModel {
                status: Set(to),
                provider_reference: Set(reference.clone()),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(from))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            txn.rollback().await?;
            let current = self.find_payment(order.id).await?.unwrap_or(payment);
            let order = self.find_order(&order.order_number).await?;
            return Ok(PaymentTransition {
                order,
                payment: current,
                changed: false,
            });
        }

        if let Some(status) = next_order_status {
            order::Entity::update_many()
                .set(order::ActiveModel {
                    status: Set(status),
                    updated_at: Set(now),
                    ..Default::default()
                })
                .filter(order::Column::Id.eq(order.id))
                .exec(&txn)
                .await?;
            order.status = status;
            order.updated_at = now;
        }
        txn.commit().await?;

        payment.status = to;
        payment.provider_reference = reference.clone();
        payment.updated_at = now;

        info!(
            order_number = %order.order_number,
            from = from.as_str(),
            to = to.as_str(),
            "Payment status changed"
        );
        counter!("bookshop_payments.status_changed", 1, "to" => to.as_str());
        self.event_sender
            .send_or_log(Event::PaymentStatusChanged {
                order_number: order.order_number.clone(),
                from,
                to,
                provider_reference: reference,
            })
            .await;

        if to == PaymentStatus::Paid && payment.method == PaymentMethod::MobileMoney {
            // The payment is already committed; a failed lookup only thins the email.
            let lines = match order_line::Entity::find()
                .filter(order_line::Column::OrderId.eq(order.id))
                .all(&*self.db)
                .await
            {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(
                        order_number = %order.order_number,
                        error = %e,
                        "Could not load order lines for paid notification"
                    );
                    counter!("bookshop_notifications.failed", 1, "channel" => "order_lines");
                    Vec::new()
                }
            };
            self.notifier.order_paid(&order, &lines);
        }

        Ok(PaymentTransition {
            order,
            payment,
            changed: true,
        })
    }
}
