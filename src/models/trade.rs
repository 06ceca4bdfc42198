use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::models::order::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    /// Existing shares change hands on one side.
    ShareTrade,
    /// Complementary YES/NO pair minted from both buyers' collateral.
    ShareCreation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Settling,
    Settled,
    Failed,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Settling => "settling",
            SettlementStatus::Settled => "settled",
            SettlementStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A matched fill. For `share_creation` the buyer is always the YES-buyer,
/// the seller the NO-buyer, and `price` the YES side's per-share cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub market_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub buyer_order_id: Uuid,
    pub seller_order_id: Uuid,
    pub trade_type: TradeType,
    pub settlement_status: SettlementStatus,
    pub settlement_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TradeRow {
    pub id: String,
    pub market_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub side: OrderSide,
    pub price: String,
    pub quantity: String,
    pub buyer_order_id: String,
    pub seller_order_id: String,
    pub trade_type: TradeType,
    pub settlement_status: SettlementStatus,
    pub settlement_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<TradeRow> for Trade {
    type Error = CoreError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        Ok(Trade {
            id: super::uuid_col(&row.id, "trades.id")?,
            market_id: row.market_id,
            buyer_id: row.buyer_id,
            seller_id: row.seller_id,
            side: row.side,
            price: super::decimal_col(&row.price, "trades.price")?,
            quantity: super::decimal_col(&row.quantity, "trades.quantity")?,
            buyer_order_id: super::uuid_col(&row.buyer_order_id, "trades.buyer_order_id")?,
            seller_order_id: super::uuid_col(&row.seller_order_id, "trades.seller_order_id")?,
            trade_type: row.trade_type,
            settlement_status: row.settlement_status,
            settlement_id: row.settlement_id,
            created_at: row.created_at,
            settled_at: row.settled_at,
        })
    }
}
