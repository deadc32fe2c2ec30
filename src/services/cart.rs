use crate::{
    entities::book,
    errors::ServiceError,
    events::{Event, EventSender},
    services::catalog,
};
use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, DatabaseConnection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// A session's cart: book id to requested quantity.
///
/// Quantities are always at least one; an entry that would drop to zero is
/// removed instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartState {
    items: BTreeMap<Uuid, u32>,
}

impl CartState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of distinct books.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn quantity(&self, book_id: &Uuid) -> u32 {
        self.items.get(book_id).copied().unwrap_or(0)
    }

    /// Total quantity across entries.
    pub fn item_count(&self) -> u32 {
        self.items.values().sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = (Uuid, u32)> + '_ {
        self.items.iter().map(|(id, qty)| (*id, *qty))
    }

    pub fn book_ids(&self) -> Vec<Uuid> {
        self.items.keys().copied().collect()
    }

    /// Decrements by one, removing the entry when it reaches zero.
    pub fn decrease(&mut self, book_id: Uuid) -> DecreaseOutcome {
        match self.items.get_mut(&book_id) {
            None => DecreaseOutcome::NotInCart,
            Some(qty) if *qty > 1 => {
                *qty -= 1;
                DecreaseOutcome::Decreased { quantity: *qty }
            }
            Some(_) => {
                self.items.remove(&book_id);
                DecreaseOutcome::Removed
            }
        }
    }

    /// Returns whether the entry existed.
    pub fn remove(&mut self, book_id: Uuid) -> bool {
        self.items.remove(&book_id).is_some()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drops entries the snapshot could not resolve. Returns the dropped ids.
    pub fn prune(&mut self, snapshot: &CartSnapshot) -> Vec<Uuid> {
        let missing = snapshot.unresolved().to_vec();
        for id in &missing {
            self.items.remove(id);
        }
        missing
    }

    fn set(&mut self, book_id: Uuid, quantity: u32) {
        if quantity == 0 {
            self.items.remove(&book_id);
        } else {
            self.items.insert(book_id, quantity);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AddOutcome {
    Added { title: String, quantity: u32 },
    /// The cart already holds every copy in stock.
    AtMaximum { stock: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecreaseOutcome {
    Decreased { quantity: u32 },
    Removed,
    NotInCart,
}

/// One resolvable cart entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartLine<'a> {
    pub book: &'a book::Model,
    pub quantity: u32,
    pub line_total: Decimal,
}

/// Cart entries resolved against the catalog at one point in time.
///
/// `iter` can be called any number of times; each call walks the lines afresh
/// in the cart's order.
#[derive(Debug, Clone, Default)]
pub struct CartSnapshot {
    entries: Vec<(book::Model, u32)>,
    unresolved: Vec<Uuid>,
}

impl CartSnapshot {
    /// Resolves `cart` on `conn`. Books that are gone or inactive are left out.
    pub async fn load<C: ConnectionTrait>(conn: &C, cart: &CartState) -> Result<Self, ServiceError> {
        let ids = cart.book_ids();
        let mut books: HashMap<Uuid, book::Model> = catalog::find_active_books(conn, &ids).await?;

        let mut snapshot = CartSnapshot::default();
        for (id, quantity) in cart.entries() {
            match books.remove(&id) {
                Some(book) => snapshot.entries.push((book, quantity)),
                None => snapshot.unresolved.push(id),
            }
        }
        Ok(snapshot)
    }

    /// Builds a snapshot from already-resolved books.
    pub fn from_entries(entries: Vec<(book::Model, u32)>) -> Self {
        Self {
            entries: entries.into_iter().filter(|(_, qty)| *qty > 0).collect(),
            unresolved: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = CartLine<'_>> + '_ {
        self.entries.iter().map(|(book, quantity)| CartLine {
            book,
            quantity: *quantity,
            line_total: book.price() * Decimal::from(*quantity),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn subtotal(&self) -> Decimal {
        self.iter().map(|line| line.line_total).sum()
    }

    pub fn item_count(&self) -> u32 {
        self.entries.iter().map(|(_, qty)| qty).sum()
    }

    /// Ids present in the cart that no longer resolve to an active book.
    pub fn unresolved(&self) -> &[Uuid] {
        &self.unresolved
    }
}

/// Cart operations that need the catalog.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Adds one copy of a book, never exceeding its current stock.
    ///
    /// Unknown or inactive books are `NotFound`; a book with no stock is
    /// `OutOfStock` and the cart is left untouched.
    #[instrument(skip(self, cart))]
    pub async fn add(&self, cart: &mut CartState, book_id: Uuid) -> Result<AddOutcome, ServiceError> {
        let book = catalog::find_active_book(&*self.db, book_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Book {} not found", book_id)))?;

        if !book.in_stock() {
            debug!(book_id = %book_id, "Rejected add of out-of-stock book");
            return Err(ServiceError::OutOfStock(book.title));
        }

        let stock = u32::try_from(book.stock).unwrap_or(0);
        let current = cart.quantity(&book_id);
        if current >= stock {
            return Ok(AddOutcome::AtMaximum { stock });
        }

        let quantity = current + 1;
        cart.set(book_id, quantity);
        debug!(book_id = %book_id, quantity, "Book added to cart");
        Ok(AddOutcome::Added {
            title: book.title,
            quantity,
        })
    }

    pub async fn snapshot(&self, cart: &CartState) -> Result<CartSnapshot, ServiceError> {
        CartSnapshot::load(&*self.db, cart).await
    }

    /// Empties the cart and records it.
    pub async fn clear(&self, cart: &mut CartState, order_number: Option<String>) {
        cart.clear();
        info!(order_number = ?order_number, "Cart cleared");
        self.event_sender
            .send_or_log(Event::CartCleared { order_number })
            .await;
    }
}
