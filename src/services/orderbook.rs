//! Per-Market Orderbook
//!
//! A binary market book holds four ordered sides: YES-bids, YES-asks,
//! NO-bids, NO-asks. Bids iterate price-descending, asks price-ascending,
//! FIFO within a level. The book carries no bookkeeping beyond order
//! identity and remaining quantity, so it is rebuildable from durable
//! orders at startup.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::models::{Order, OrderAction, OrderSide, OrderType};

/// Price level with 8 decimal precision for exact comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceLevel(i64);

impl PriceLevel {
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = price * Decimal::from(100_000_000);
        let truncated = scaled.trunc();
        let value = truncated.mantissa() / 10i128.pow(truncated.scale());
        PriceLevel(value as i64)
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(100_000_000)
    }
}

impl Ord for PriceLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One of the four book sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookSide {
    YesBid,
    YesAsk,
    NoBid,
    NoAsk,
}

impl BookSide {
    pub fn of(side: OrderSide, action: OrderAction) -> Self {
        match (side, action) {
            (OrderSide::Yes, OrderAction::Buy) => BookSide::YesBid,
            (OrderSide::Yes, OrderAction::Sell) => BookSide::YesAsk,
            (OrderSide::No, OrderAction::Buy) => BookSide::NoBid,
            (OrderSide::No, OrderAction::Sell) => BookSide::NoAsk,
        }
    }

    pub fn is_bid(self) -> bool {
        matches!(self, BookSide::YesBid | BookSide::NoBid)
    }
}

/// An order resting on the book. Remaining quantity is derived, never
/// stored.
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub id: Uuid,
    pub market_id: String,
    pub user_id: String,
    pub side: OrderSide,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub created_at: DateTime<Utc>,
}

impl BookOrder {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn book_side(&self) -> BookSide {
        BookSide::of(self.side, self.action)
    }
}

impl TryFrom<&Order> for BookOrder {
    type Error = CoreError;

    fn try_from(order: &Order) -> Result<Self, Self::Error> {
        let price = order.price.ok_or_else(|| {
            CoreError::Internal(format!("order {} has no price, cannot rest", order.id))
        })?;
        Ok(BookOrder {
            id: order.id,
            market_id: order.market_id.clone(),
            user_id: order.user_id.clone(),
            side: order.side,
            action: order.action,
            order_type: order.order_type,
            price,
            quantity: order.quantity,
            filled_quantity: order.filled_quantity,
            created_at: order.created_at,
        })
    }
}

/// Aggregated level for snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct LevelView {
    pub price: Decimal,
    pub quantity: Decimal,
    pub order_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub market_id: String,
    pub yes_bids: Vec<LevelView>,
    pub yes_asks: Vec<LevelView>,
    pub no_bids: Vec<LevelView>,
    pub no_asks: Vec<LevelView>,
    pub timestamp: i64,
}

pub struct OrderBook {
    market_id: String,
    yes_bids: BTreeMap<PriceLevel, VecDeque<BookOrder>>,
    yes_asks: BTreeMap<PriceLevel, VecDeque<BookOrder>>,
    no_bids: BTreeMap<PriceLevel, VecDeque<BookOrder>>,
    no_asks: BTreeMap<PriceLevel, VecDeque<BookOrder>>,
    /// Order id → (side, level) for O(1) removal.
    order_index: HashMap<Uuid, (BookSide, PriceLevel)>,
}

impl OrderBook {
    pub fn new(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            yes_bids: BTreeMap::new(),
            yes_asks: BTreeMap::new(),
            no_bids: BTreeMap::new(),
            no_asks: BTreeMap::new(),
            order_index: HashMap::new(),
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn order_count(&self) -> usize {
        self.order_index.len()
    }

    fn side(&self, side: BookSide) -> &BTreeMap<PriceLevel, VecDeque<BookOrder>> {
        match side {
            BookSide::YesBid => &self.yes_bids,
            BookSide::YesAsk => &self.yes_asks,
            BookSide::NoBid => &self.no_bids,
            BookSide::NoAsk => &self.no_asks,
        }
    }

    fn side_mut(&mut self, side: BookSide) -> &mut BTreeMap<PriceLevel, VecDeque<BookOrder>> {
        match side {
            BookSide::YesBid => &mut self.yes_bids,
            BookSide::YesAsk => &mut self.yes_asks,
            BookSide::NoBid => &mut self.no_bids,
            BookSide::NoAsk => &mut self.no_asks,
        }
    }

    pub fn add_order(&mut self, entry: BookOrder) -> Result<(), CoreError> {
        if entry.market_id != self.market_id {
            return Err(CoreError::Internal(format!(
                "order {} belongs to market {}, book is {}",
                entry.id, entry.market_id, self.market_id
            )));
        }
        if self.order_index.contains_key(&entry.id) {
            return Ok(());
        }

        let book_side = entry.book_side();
        let level = PriceLevel::from_decimal(entry.price);
        let order_id = entry.id;

        self.side_mut(book_side)
            .entry(level)
            .or_default()
            .push_back(entry);
        self.order_index.insert(order_id, (book_side, level));
        Ok(())
    }

    /// Idempotent; absent ids return None.
    pub fn remove_order(&mut self, order_id: Uuid) -> Option<BookOrder> {
        let (book_side, level) = self.order_index.remove(&order_id)?;
        let levels = self.side_mut(book_side);
        let queue = levels.get_mut(&level)?;
        let pos = queue.iter().position(|o| o.id == order_id)?;
        let entry = queue.remove(pos);
        if queue.is_empty() {
            levels.remove(&level);
        }
        entry
    }

    /// Mutate a resting order in place, preserving its queue position.
    /// Returns false if the order is not on the book.
    pub fn update_order(&mut self, order_id: Uuid, filled_quantity: Decimal) -> bool {
        let Some(&(book_side, level)) = self.order_index.get(&order_id) else {
            return false;
        };
        let Some(queue) = self.side_mut(book_side).get_mut(&level) else {
            return false;
        };
        match queue.iter_mut().find(|o| o.id == order_id) {
            Some(entry) => {
                entry.filled_quantity = filled_quantity;
                true
            }
            None => false,
        }
    }

    pub fn get_order(&self, order_id: Uuid) -> Option<&BookOrder> {
        let &(book_side, level) = self.order_index.get(&order_id)?;
        self.side(book_side)
            .get(&level)?
            .iter()
            .find(|o| o.id == order_id)
    }

    pub fn contains(&self, order_id: Uuid) -> bool {
        self.order_index.contains_key(&order_id)
    }

    /// Best price on a side: highest bid, lowest ask.
    pub fn best_price(&self, side: BookSide) -> Option<Decimal> {
        let levels = self.side(side);
        let level = if side.is_bid() {
            levels.keys().next_back()
        } else {
            levels.keys().next()
        };
        level.map(PriceLevel::to_decimal)
    }

    /// Candidate fills for the matcher: `(order id, price, created_at)` in
    /// book priority order (bids best-first descending, asks ascending).
    pub fn priority_scan(&self, side: BookSide) -> Vec<(Uuid, Decimal, DateTime<Utc>)> {
        let levels = self.side(side);
        let collect = |queue: &VecDeque<BookOrder>, price: Decimal| {
            queue
                .iter()
                .map(move |o| (o.id, price, o.created_at))
                .collect::<Vec<_>>()
        };
        if side.is_bid() {
            levels
                .iter()
                .rev()
                .flat_map(|(level, queue)| collect(queue, level.to_decimal()))
                .collect()
        } else {
            levels
                .iter()
                .flat_map(|(level, queue)| collect(queue, level.to_decimal()))
                .collect()
        }
    }

    pub fn snapshot(&self) -> BookSnapshot {
        fn aggregate<'a>(
            levels: impl Iterator<Item = (&'a PriceLevel, &'a VecDeque<BookOrder>)>,
        ) -> Vec<LevelView> {
            levels
                .map(|(level, queue)| LevelView {
                    price: level.to_decimal(),
                    quantity: queue.iter().map(BookOrder::remaining).sum(),
                    order_count: queue.len(),
                })
                .filter(|view| view.quantity > Decimal::ZERO)
                .collect()
        }

        BookSnapshot {
            market_id: self.market_id.clone(),
            yes_bids: aggregate(self.yes_bids.iter().rev()),
            yes_asks: aggregate(self.yes_asks.iter()),
            no_bids: aggregate(self.no_bids.iter().rev()),
            no_asks: aggregate(self.no_asks.iter()),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
