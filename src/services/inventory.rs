use crate::{
    entities::book,
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Atomically decrements a book's stock by `quantity` if enough is on hand.
///
/// The check and the decrement are a single conditional UPDATE, so concurrent
/// callers can never drive stock below zero. Returns the stock left afterwards.
/// Callers that need the returned value to be exact must pass a transaction.
pub async fn reserve_stock<C: ConnectionTrait>(
    conn: &C,
    book_id: Uuid,
    quantity: i32,
) -> Result<i32, ServiceError> {
    if quantity < 1 {
        return Err(ServiceError::ValidationError(format!(
            "Reservation quantity must be at least 1, got {}",
            quantity
        )));
    }

    let result = book::Entity::update_many()
        .col_expr(book::Column::Stock, Expr::col(book::Column::Stock).sub(quantity))
        .col_expr(book::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(book::Column::Id.eq(book_id))
        .filter(book::Column::Stock.gte(quantity))
        .exec(conn)
        .await?;

    let current = book::Entity::find_by_id(book_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Book {} not found", book_id)))?;

    if result.rows_affected == 0 {
        warn!(
            book_id = %book_id,
            requested = quantity,
            available = current.stock,
            "Insufficient stock for reservation"
        );
        return Err(ServiceError::InsufficientStock {
            title: current.title,
            requested: quantity,
            available: current.stock,
        });
    }

    Ok(current.stock)
}

/// Puts `quantity` copies back on the shelf. Returns the new stock.
pub async fn release_stock<C: ConnectionTrait>(
    conn: &C,
    book_id: Uuid,
    quantity: i32,
) -> Result<i32, ServiceError> {
    if quantity < 1 {
        return Err(ServiceError::ValidationError(format!(
            "Release quantity must be at least 1, got {}",
            quantity
        )));
    }

    let result = book::Entity::update_many()
        .col_expr(book::Column::Stock, Expr::col(book::Column::Stock).add(quantity))
        .col_expr(book::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(book::Column::Id.eq(book_id))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::NotFound(format!("Book {} not found", book_id)));
    }

    let current = book::Entity::find_by_id(book_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Book {} not found", book_id)))?;
    Ok(current.stock)
}

/// Stand-alone stock reservation, each call in its own transaction.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self))]
    pub async fn reserve(&self, book_id: Uuid, quantity: i32) -> Result<i32, ServiceError> {
        let txn = self.db.begin().await?;
        let remaining = match reserve_stock(&txn, book_id, quantity).await {
            Ok(remaining) => remaining,
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(error = %rb, "Rollback after failed reservation failed");
                }
                return Err(e);
            }
        };
        txn.commit().await?;

        info!(book_id = %book_id, quantity, remaining, "Stock reserved");
        self.event_sender
            .send_or_log(Event::StockReserved {
                book_id,
                quantity,
                remaining,
            })
            .await;
        Ok(remaining)
    }

    #[instrument(skip(self))]
    pub async fn release(&self, book_id: Uuid, quantity: i32) -> Result<i32, ServiceError> {
        let txn = self.db.begin().await?;
        let remaining = match release_stock(&txn, book_id, quantity).await {
            Ok(remaining) => remaining,
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(error = %rb, "Rollback after failed release failed");
                }
                return Err(e);
            }
        };
        txn.commit().await?;

        info!(book_id = %book_id, quantity, remaining, "Stock released");
        self.event_sender
            .send_or_log(Event::StockReleased {
                book_id,
                quantity,
                remaining,
            })
            .await;
        Ok(remaining)
    }
}
