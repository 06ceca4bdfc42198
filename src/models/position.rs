use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::CoreError;
use crate::models::order::OrderSide;

/// Share holding, keyed logically by `(user_id, market_id, side)` while
/// active. The ledger evolves positions UTXO-style (archive+create per
/// mutation), so `contract_id` tracks only the latest incarnation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub user_id: String,
    pub market_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub locked_quantity: Decimal,
    pub avg_cost_basis: Decimal,
    pub is_archived: bool,
    pub contract_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn available(&self) -> Decimal {
        self.quantity - self.locked_quantity
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PositionRow {
    pub id: String,
    pub user_id: String,
    pub market_id: String,
    pub side: OrderSide,
    pub quantity: String,
    pub locked_quantity: String,
    pub avg_cost_basis: String,
    pub is_archived: bool,
    pub contract_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl TryFrom<PositionRow> for Position {
    type Error = CoreError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        Ok(Position {
            id: row.id,
            user_id: row.user_id,
            market_id: row.market_id,
            side: row.side,
            quantity: super::decimal_col(&row.quantity, "positions.quantity")?,
            locked_quantity: super::decimal_col(&row.locked_quantity, "positions.locked_quantity")?,
            avg_cost_basis: super::decimal_col(&row.avg_cost_basis, "positions.avg_cost_basis")?,
            is_archived: row.is_archived,
            contract_id: row.contract_id,
            last_updated: row.last_updated,
        })
    }
}
