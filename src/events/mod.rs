use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::{PaymentMethod, PaymentStatus};

/// Domain events raised by the checkout pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderPlaced {
        order_id: Uuid,
        order_number: String,
        payment_method: PaymentMethod,
        total: Decimal,
        line_count: usize,
        placed_at: DateTime<Utc>,
    },
    StockReserved {
        book_id: Uuid,
        quantity: i32,
        remaining: i32,
    },
    StockReleased {
        book_id: Uuid,
        quantity: i32,
        remaining: i32,
    },
    PaymentStatusChanged {
        order_number: String,
        from: PaymentStatus,
        to: PaymentStatus,
        provider_reference: Option<String>,
    },
    CartCleared {
        order_number: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, failing only if the receiver is gone.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event and logs instead of failing the caller.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPlaced {
                order_number,
                payment_method,
                total,
                line_count,
                ..
            } => info!(
                order_number = %order_number,
                payment_method = payment_method.as_str(),
                total = %total,
                line_count,
                "Order placed"
            ),
            Event::StockReserved {
                book_id,
                quantity,
                remaining,
            } => debug!(book_id = %book_id, quantity, remaining, "Stock reserved"),
            Event::StockReleased {
                book_id,
                quantity,
                remaining,
            } => info!(book_id = %book_id, quantity, remaining, "Stock released"),
            Event::PaymentStatusChanged {
                order_number,
                from,
                to,
                ..
            } => info!(
                order_number = %order_number,
                from = from.as_str(),
                to = to.as_str(),
                "Payment status changed"
            ),
            Event::CartCleared { order_number } => {
                debug!(order_number = ?order_number, "Cart cleared")
            }
        }
    }

    info!("Event channel closed; stopping event processing");
}
