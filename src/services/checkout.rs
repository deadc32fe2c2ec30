use crate::{
    db::is_unique_violation,
    entities::{order, order_line, payment, shipping_method, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    money::Money,
    notifications::NotificationDispatcher,
    services::{
        cart::{CartService, CartSnapshot, CartState},
        catalog,
        inventory::reserve_stock,
        order_numbers::OrderNumberGenerator,
        payments::{PaymentRequest, PaymentService, PaymentTransition},
    },
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, DatabaseTransaction, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Delivery and payment details submitted at checkout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CheckoutForm {
    pub shipping_method_id: Uuid,
    #[validate(custom = "required", length(max = 120))]
    pub full_name: String,
    #[validate(custom = "required", length(max = 254))]
    pub email: String,
    #[validate(custom = "required", length(max = 40))]
    pub phone: String,
    #[validate(custom = "required", length(max = 255))]
    pub address_line1: String,
    #[serde(default)]
    pub address_line2: Option<String>,
    #[validate(custom = "required", length(max = 120))]
    pub city: String,
    #[validate(custom = "required", length(max = 120))]
    pub region: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
}

impl CheckoutForm {
    /// Trims every text field; blank optional fields become `None`.
    pub fn normalized(self) -> Self {
        fn optional(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        Self {
            full_name: self.full_name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: self.phone.trim().to_string(),
            address_line1: self.address_line1.trim().to_string(),
            address_line2: optional(self.address_line2),
            city: self.city.trim().to_string(),
            region: self.region.trim().to_string(),
            notes: optional(self.notes),
            ..self
        }
    }
}

fn required(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("required");
        err.message = Some("Please complete the required fields.".into());
        return Err(err);
    }
    Ok(())
}

/// Where the caller should go after a successful checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum NextStep {
    /// The order is complete; show the confirmation.
    Confirmation { order_number: String },
    /// Mobile money must be started before the order is paid.
    StartMobileMoney { order_number: String },
}

impl NextStep {
    pub fn location(&self) -> String {
        match self {
            Self::Confirmation { order_number } => {
                format!("/api/v1/orders/{}/success", order_number)
            }
            Self::StartMobileMoney { order_number } => {
                format!("/api/v1/payments/momo/{}/start", order_number)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutOutcome {
    pub order: order::Model,
    pub lines: Vec<order_line::Model>,
    pub payment: payment::Model,
    pub next: NextStep,
}

/// What the checkout page shows before the customer submits.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSummary {
    pub shipping_methods: Vec<shipping_method::Model>,
    pub item_count: u32,
    pub subtotal: Decimal,
    pub default_shipping_fee: Decimal,
    pub subtotal_plus_shipping: Decimal,
}

/// Totals for an order, in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Money,
    pub shipping_fee: Money,
    pub total: Money,
}

impl OrderTotals {
    pub fn compute(snapshot: &CartSnapshot, shipping_fee: Decimal) -> Result<Self, ServiceError> {
        let subtotal = Money::try_from_decimal(snapshot.subtotal())?;
        let shipping_fee = Money::try_from_decimal(shipping_fee)?;
        let total = subtotal
            .minor()
            .checked_add(shipping_fee.minor())
            .map(Money::from_minor)
            .ok_or_else(|| ServiceError::ValidationError("order total is out of range".into()))?;

        Ok(Self {
            subtotal,
            shipping_fee,
            total,
        })
    }
}

/// Turns a cart into a persisted order, its lines and its payment.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    carts: CartService,
    payments: PaymentService,
    notifier: NotificationDispatcher,
    order_numbers: Arc<dyn OrderNumberGenerator>,
    event_sender: Arc<EventSender>,
    order_number_max_attempts: u32,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        payments: PaymentService,
        notifier: NotificationDispatcher,
        order_numbers: Arc<dyn OrderNumberGenerator>,
        event_sender: Arc<EventSender>,
        order_number_max_attempts: u32,
    ) -> Self {
        Self {
            db,
            carts,
            payments,
            notifier,
            order_numbers,
            event_sender,
            order_number_max_attempts: order_number_max_attempts.max(1),
        }
    }

    /// Shipping options and running totals for the checkout page.
    #[instrument(skip(self, cart))]
    pub async fn summary(&self, cart: &CartState) -> Result<CheckoutSummary, ServiceError> {
        let shipping_methods = catalog::list_active_shipping_methods(&*self.db).await?;
        let snapshot = self.carts.snapshot(cart).await?;

        let subtotal = snapshot.subtotal();
        let default_shipping_fee = shipping_methods
            .first()
            .map(|m| m.fee())
            .unwrap_or(Decimal::ZERO);

        if shipping_methods.is_empty() {
            warn!("No active shipping methods configured");
        }

        Ok(CheckoutSummary {
            item_count: snapshot.item_count(),
            subtotal,
            default_shipping_fee,
            subtotal_plus_shipping: subtotal + default_shipping_fee,
            shipping_methods,
        })
    }

    /// Places an order for everything in `cart`.
    ///
    /// Order, lines, stock decrements and payment are written in one
    /// transaction: if any line cannot be reserved nothing is persisted and
    /// the cart is left as it was. Cash-on-delivery orders clear the cart and
    /// notify the customer immediately; mobile-money orders do so once the
    /// payment is started.
    #[instrument(skip(self, cart, form), fields(payment_method = form.payment_method.as_str()))]
    pub async fn place_order(
        &self,
        cart: &mut CartState,
        form: CheckoutForm,
    ) -> Result<CheckoutOutcome, ServiceError> {
        if cart.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let shipping = catalog::find_active_shipping_method(&*self.db, form.shipping_method_id)
            .await?
            .ok_or_else(|| {
                ServiceError::ValidationError("Please select a valid delivery option.".into())
            })?;

        let form = form.normalized();
        form.validate()?;

        let txn = self.db.begin().await?;
        let placed = match self.persist_order(&txn, cart, &form, &shipping).await {
            Ok(placed) => placed,
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(error = %rb, "Checkout rollback failed");
                }
                if matches!(e, ServiceError::InsufficientStock { .. }) {
                    counter!("bookshop_checkout.insufficient_stock", 1);
                }
                return Err(e);
            }
        };
        txn.commit().await?;

        let PlacedOrder {
            order,
            lines,
            payment,
            reserved,
        } = placed;

        info!(
            order_number = %order.order_number,
            total = %order.total(),
            lines = lines.len(),
            "Order placed"
        );
        counter!("bookshop_checkout.completed", 1, "payment_method" => payment.method.as_str());

        for (book_id, quantity, remaining) in reserved {
            self.event_sender
                .send_or_log(Event::StockReserved {
                    book_id,
                    quantity,
                    remaining,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::OrderPlaced {
                order_id: order.id,
                order_number: order.order_number.clone(),
                payment_method: payment.method,
                total: order.total(),
                line_count: lines.len(),
                placed_at: order.created_at,
            })
            .await;

        let next = match payment.method {
            PaymentMethod::CashOnDelivery => {
                self.event_sender
                    .send_or_log(Event::PaymentStatusChanged {
                        order_number: order.order_number.clone(),
                        from: PaymentStatus::Pending,
                        to: payment.status,
                        provider_reference: payment.provider_reference.clone(),
                    })
                    .await;
                self.carts
                    .clear(cart, Some(order.order_number.clone()))
                    .await;
                self.notifier.order_placed_cod(&order, &lines);
                NextStep::Confirmation {
                    order_number: order.order_number.clone(),
                }
            }
            PaymentMethod::MobileMoney => NextStep::StartMobileMoney {
                order_number: order.order_number.clone(),
            },
        };

        Ok(CheckoutOutcome {
            order,
            lines,
            payment,
            next,
        })
    }

    /// Starts (or re-checks) the mobile-money payment for an order and clears
    /// the cart once it is paid.
    #[instrument(skip(self, cart))]
    pub async fn start_payment(
        &self,
        order_number: &str,
        cart: &mut CartState,
    ) -> Result<PaymentTransition, ServiceError> {
        let transition = self.payments.start(order_number).await?;
        if transition.payment.status == PaymentStatus::Paid && !cart.is_empty() {
            self.carts
                .clear(cart, Some(order_number.to_string()))
                .await;
        }
        Ok(transition)
    }

    async fn persist_order(
        &self,
        txn: &DatabaseTransaction,
        cart: &CartState,
        form: &CheckoutForm,
        shipping: &shipping_method::Model,
    ) -> Result<PlacedOrder, ServiceError> {
        let snapshot = CartSnapshot::load(txn, cart).await?;
        if snapshot.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let totals = OrderTotals::compute(&snapshot, shipping.fee())?;
        let order = self.insert_order(txn, form, shipping, &totals).await?;

        let mut lines = Vec::new();
        let mut reserved = Vec::new();
        for line in snapshot.iter() {
            let quantity = i32::try_from(line.quantity).map_err(|_| {
                ServiceError::ValidationError(format!("Quantity {} is too large", line.quantity))
            })?;
            let unit_price = Money::from_minor(line.book.price_minor);
            let line_total = Money::try_from_decimal(line.line_total)?;

            let created = order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                order_number: Set(order.order_number.clone()),
                book_id: Set(line.book.id),
                title_snapshot: Set(line.book.title.clone()),
                unit_price_minor: Set(unit_price.minor()),
                quantity: Set(quantity),
                line_total_minor: Set(line_total.minor()),
            }
            .insert(txn)
            .await?;

            let remaining = reserve_stock(txn, line.book.id, quantity).await?;
            reserved.push((line.book.id, quantity, remaining));
            lines.push(created);
        }

        let request = PaymentRequest {
            order_number: order.order_number.clone(),
            amount: order.total(),
            phone: order.phone.clone(),
        };
        let opening = self
            .payments
            .opening_outcome(form.payment_method, &request)
            .await?;

        let now = Utc::now();
        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            method: Set(form.payment_method),
            provider: Set(self.payments.provider(form.payment_method).name().to_string()),
            status: Set(opening.status),
            amount_minor: Set(totals.total.minor()),
            provider_reference: Set(opening.reference),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        Ok(PlacedOrder {
            order,
            lines,
            payment,
            reserved,
        })
    }

    /// Inserts the order row, drawing a fresh number whenever the unique
    /// index rejects the previous one.
    async fn insert_order(
        &self,
        txn: &DatabaseTransaction,
        form: &CheckoutForm,
        shipping: &shipping_method::Model,
        totals: &OrderTotals,
    ) -> Result<order::Model, ServiceError> {
        for attempt in 1..=self.order_number_max_attempts {
            let order_number = self.order_numbers.next_number();
            let now = Utc::now();
            let model = order::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_number: Set(order_number.clone()),
                customer_id: Set(form.customer_id),
                full_name: Set(form.full_name.clone()),
                email: Set(form.email.clone()),
                phone: Set(form.phone.clone()),
                address_line1: Set(form.address_line1.clone()),
                address_line2: Set(form.address_line2.clone()),
                city: Set(form.city.clone()),
                region: Set(form.region.clone()),
                notes: Set(form.notes.clone()),
                shipping_method_id: Set(shipping.id),
                subtotal_minor: Set(totals.subtotal.minor()),
                shipping_fee_minor: Set(totals.shipping_fee.minor()),
                total_minor: Set(totals.total.minor()),
                status: Set(OrderStatus::New),
                created_at: Set(now),
                updated_at: Set(now),
            };

            // A failed insert must not poison the outer transaction.
            let savepoint = txn.begin().await?;
            match model.insert(&savepoint).await {
                Ok(order) => {
                    savepoint.commit().await?;
                    return Ok(order);
                }
                Err(e) if is_unique_violation(&e) => {
                    savepoint.rollback().await?;
                    warn!(
                        order_number = %order_number,
                        attempt,
                        "Order number collision; retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::OrderNumberCollision(
            self.order_number_max_attempts,
        ))
    }
}

struct PlacedOrder {
    order: order::Model,
    lines: Vec<order_line::Model>,
    payment: payment::Model,
    reserved: Vec<(Uuid, i32, i32)>,
}
