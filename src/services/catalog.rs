//! Read-only lookups into the book and shipping catalog.
//!
//! Every function takes any `ConnectionTrait` so the same query runs on the
//! pool or inside a checkout transaction.

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use std::collections::HashMap;
use uuid::Uuid;

use crate::entities::{book, shipping_method};
use crate::errors::ServiceError;

pub async fn find_book<C: ConnectionTrait>(
    conn: &C,
    book_id: Uuid,
) -> Result<Option<book::Model>, ServiceError> {
    Ok(book::Entity::find_by_id(book_id).one(conn).await?)
}

/// Resolves a book only if it is still listed for sale.
pub async fn find_active_book<C: ConnectionTrait>(
    conn: &C,
    book_id: Uuid,
) -> Result<Option<book::Model>, ServiceError> {
    Ok(find_book(conn, book_id).await?.filter(|b| b.is_active))
}

/// Loads the active books among `ids`, keyed by id. Missing or inactive ids are absent.
pub async fn find_active_books<C: ConnectionTrait>(
    conn: &C,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, book::Model>, ServiceError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let books = book::Entity::find()
        .filter(book::Column::Id.is_in(ids.iter().copied()))
        .filter(book::Column::IsActive.eq(true))
        .all(conn)
        .await?;

    Ok(books.into_iter().map(|b| (b.id, b)).collect())
}

pub async fn find_active_shipping_method<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> Result<Option<shipping_method::Model>, ServiceError> {
    Ok(shipping_method::Entity::find_by_id(id)
        .one(conn)
        .await?
        .filter(|m| m.is_active))
}

/// Active shipping methods, cheapest first.
pub async fn list_active_shipping_methods<C: ConnectionTrait>(
    conn: &C,
) -> Result<Vec<shipping_method::Model>, ServiceError> {
    Ok(shipping_method::Entity::find()
        .filter(shipping_method::Column::IsActive.eq(true))
        .order_by_asc(shipping_method::Column::FeeMinor)
        .order_by_asc(shipping_method::Column::Name)
        .all(conn)
        .await?)
}
