use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::models::trade::Trade;

/// Which binary outcome the order trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Yes,
    No,
}

impl OrderSide {
    /// The complementary outcome side.
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Yes => OrderSide::No,
            OrderSide::No => OrderSide::Yes,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Yes => write!(f, "yes"),
            OrderSide::No => write!(f, "no"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderAction::Buy => write!(f, "buy"),
            OrderAction::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Reserved but not yet matched.
    Pending,
    /// Resting on the book, nothing filled.
    Open,
    /// Resting on the book with some fills.
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Statuses that keep an order on the book.
    pub fn is_resting(self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::Partial)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub market_id: String,
    pub user_id: String,
    pub side: OrderSide,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
    pub locked_amount: Decimal,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

/// Raw `orders` row. Money and ids are TEXT in SQLite.
#[derive(Debug, Clone, FromRow)]
pub struct OrderRow {
    pub id: String,
    pub market_id: String,
    pub user_id: String,
    pub side: OrderSide,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub price: Option<String>,
    pub quantity: String,
    pub filled_quantity: String,
    pub status: OrderStatus,
    pub locked_amount: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = CoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: super::uuid_col(&row.id, "orders.id")?,
            market_id: row.market_id,
            user_id: row.user_id,
            side: row.side,
            action: row.action,
            order_type: row.order_type,
            price: row
                .price
                .as_deref()
                .map(|p| super::decimal_col(p, "orders.price"))
                .transpose()?,
            quantity: super::decimal_col(&row.quantity, "orders.quantity")?,
            filled_quantity: super::decimal_col(&row.filled_quantity, "orders.filled_quantity")?,
            status: row.status,
            locked_amount: super::decimal_col(&row.locked_amount, "orders.locked_amount")?,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Order placement request as received from the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub market_id: String,
    pub side: OrderSide,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
}

/// Outcome of `OrderService::place_order`. Serialized verbatim into the
/// idempotency cache so replays return the original response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceResult {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub trades: Vec<Trade>,
    pub locked_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderFilters {
    pub market_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
}

impl OrderFilters {
    pub fn get_limit(&self) -> usize {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}
