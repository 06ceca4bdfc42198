use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::errors::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketStatus::Open => write!(f, "open"),
            MarketStatus::Closed => write!(f, "closed"),
            MarketStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// A binary prediction market. `yes_price + no_price = 1` always.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub description: String,
    pub resolution_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: MarketStatus,
    /// Set only when `status = resolved`.
    pub outcome: Option<bool>,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub volume_24h: Decimal,
    pub total_volume: Decimal,
    pub open_interest: Decimal,
    /// Active Market contract on the ledger.
    pub contract_id: Option<String>,
    /// Monotonic per state transition; projections keep the highest.
    pub version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct MarketRow {
    pub id: String,
    pub question: String,
    pub description: String,
    pub resolution_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: MarketStatus,
    pub outcome: Option<bool>,
    pub yes_price: String,
    pub no_price: String,
    pub volume_24h: String,
    pub total_volume: String,
    pub open_interest: String,
    pub contract_id: Option<String>,
    pub version: i64,
}

impl TryFrom<MarketRow> for Market {
    type Error = CoreError;

    fn try_from(row: MarketRow) -> Result<Self, Self::Error> {
        Ok(Market {
            id: row.id,
            question: row.question,
            description: row.description,
            resolution_time: row.resolution_time,
            created_at: row.created_at,
            status: row.status,
            outcome: row.outcome,
            yes_price: super::decimal_col(&row.yes_price, "markets.yes_price")?,
            no_price: super::decimal_col(&row.no_price, "markets.no_price")?,
            volume_24h: super::decimal_col(&row.volume_24h, "markets.volume_24h")?,
            total_volume: super::decimal_col(&row.total_volume, "markets.total_volume")?,
            open_interest: super::decimal_col(&row.open_interest, "markets.open_interest")?,
            contract_id: row.contract_id,
            version: row.version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMarketRequest {
    pub market_id: String,
    pub question: String,
    #[serde(default)]
    pub description: String,
    pub resolution_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_row_price_invariant() {
        let row = MarketRow {
            id: "mkt-1".into(),
            question: "Will it rain tomorrow?".into(),
            description: String::new(),
            resolution_time: Utc::now(),
            created_at: Utc::now(),
            status: MarketStatus::Open,
            outcome: None,
            yes_price: "0.62".into(),
            no_price: "0.38".into(),
            volume_24h: "0".into(),
            total_volume: "0".into(),
            open_interest: "0".into(),
            contract_id: None,
            version: 1,
        };
        let market = Market::try_from(row).unwrap();
        assert_eq!(market.yes_price + market.no_price, dec!(1));
    }
}
