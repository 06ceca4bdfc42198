//! Market Lifecycle Service
//!
//! Admin-facing market management plus the trade-side statistics kept on
//! the market row. Lifecycle is strictly `open → closed → resolved`;
//! every transition bumps `version` and mirrors to the ledger.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::SqliteConnection;

use crate::db::Database;
use crate::errors::CoreError;
use crate::ledger::{templates, CommandRequest, LedgerClient};
use crate::models::{CreateMarketRequest, Market, MarketRow, MarketStatus, OrderSide, Trade};
use crate::ws::messages::OutboundMessage;
use crate::ws::SubscriptionHub;

const MARKET_COLUMNS: &str = "id, question, description, resolution_time, created_at, status, \
                              outcome, yes_price, no_price, volume_24h, total_volume, \
                              open_interest, contract_id, version";

pub struct MarketService {
    db: Database,
    ledger: Arc<dyn LedgerClient>,
    hub: Arc<SubscriptionHub>,
    admin_party: String,
}

impl MarketService {
    pub fn new(
        db: Database,
        ledger: Arc<dyn LedgerClient>,
        hub: Arc<SubscriptionHub>,
        admin_party: String,
    ) -> Self {
        Self {
            db,
            ledger,
            hub,
            admin_party,
        }
    }

    pub async fn create_market(&self, req: CreateMarketRequest) -> Result<Market, CoreError> {
        if req.market_id.trim().is_empty() {
            return Err(CoreError::validation("INVALID_MARKET_ID", "market id is empty"));
        }
        if req.question.trim().is_empty() {
            return Err(CoreError::validation("INVALID_QUESTION", "question is empty"));
        }
        if self.get_market(&req.market_id).await.is_ok() {
            return Err(CoreError::conflict(
                "MARKET_EXISTS",
                format!("market {} already exists", req.market_id),
            ));
        }

        let now = Utc::now();
        let payload = json!({
            "marketId": req.market_id,
            "question": req.question,
            "description": req.description,
            "resolutionTime": req.resolution_time,
            "version": 1,
        });
        let result = self
            .ledger
            .submit_command(CommandRequest::create(
                format!("create-market-{}", req.market_id),
                self.admin_party.clone(),
                templates::MARKET,
                payload,
            ))
            .await?;

        let market = Market {
            id: req.market_id,
            question: req.question,
            description: req.description,
            resolution_time: req.resolution_time,
            created_at: now,
            status: MarketStatus::Open,
            outcome: None,
            yes_price: Decimal::new(5, 1),
            no_price: Decimal::new(5, 1),
            volume_24h: Decimal::ZERO,
            total_volume: Decimal::ZERO,
            open_interest: Decimal::ZERO,
            contract_id: result.contract_id,
            version: 1,
        };

        sqlx::query(
            "INSERT INTO markets (id, question, description, resolution_time, created_at, status,
                                  yes_price, no_price, contract_id, version)
             VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?8, 1)",
        )
        .bind(&market.id)
        .bind(&market.question)
        .bind(&market.description)
        .bind(market.resolution_time)
        .bind(market.created_at)
        .bind(market.yes_price.to_string())
        .bind(market.no_price.to_string())
        .bind(&market.contract_id)
        .execute(&self.db.pool)
        .await?;

        tracing::info!(market = %market.id, "market created");
        Ok(market)
    }

    pub async fn close_market(&self, market_id: &str) -> Result<Market, CoreError> {
        let market = self.get_market(market_id).await?;
        if market.status != MarketStatus::Open {
            return Err(CoreError::conflict(
                "MARKET_NOT_OPEN",
                format!("market {market_id} is {}", market.status),
            ));
        }

        if let Some(contract_id) = &market.contract_id {
            self.ledger
                .submit_command(CommandRequest::exercise(
                    format!("close-{market_id}"),
                    self.admin_party.clone(),
                    templates::MARKET,
                    contract_id.clone(),
                    "CloseMarket",
                    json!({}),
                ))
                .await?;
        }

        sqlx::query("UPDATE markets SET status = 'closed', version = version + 1 WHERE id = ?1")
            .bind(market_id)
            .execute(&self.db.pool)
            .await?;

        let market = self.get_market(market_id).await?;
        self.emit_market_update(&market);
        tracing::info!(market = %market_id, "market closed");
        Ok(market)
    }

    /// Resolution requires the market to be closed first.
    pub async fn resolve_market(&self, market_id: &str, outcome: bool) -> Result<Market, CoreError> {
        let market = self.get_market(market_id).await?;
        match market.status {
            MarketStatus::Closed => {}
            MarketStatus::Resolved => {
                return Err(CoreError::conflict(
                    "MARKET_ALREADY_RESOLVED",
                    format!("market {market_id} is already resolved"),
                ))
            }
            MarketStatus::Open => {
                return Err(CoreError::conflict(
                    "MARKET_NOT_CLOSED",
                    format!("market {market_id} must be closed before resolution"),
                ))
            }
        }

        if let Some(contract_id) = &market.contract_id {
            self.ledger
                .submit_command(CommandRequest::exercise(
                    format!("resolve-{market_id}"),
                    self.admin_party.clone(),
                    templates::MARKET,
                    contract_id.clone(),
                    "ResolveMarket",
                    json!({ "outcome": outcome }),
                ))
                .await?;
        }

        sqlx::query(
            "UPDATE markets SET status = 'resolved', outcome = ?1, version = version + 1
             WHERE id = ?2",
        )
        .bind(outcome)
        .bind(market_id)
        .execute(&self.db.pool)
        .await?;

        let market = self.get_market(market_id).await?;
        self.emit_market_update(&market);
        tracing::info!(market = %market_id, outcome, "market resolved");
        Ok(market)
    }

    pub async fn get_market(&self, market_id: &str) -> Result<Market, CoreError> {
        get_market(&self.db.pool, market_id)
            .await?
            .ok_or_else(|| CoreError::market_not_found(market_id))
    }

    pub async fn list_markets(&self) -> Result<Vec<Market>, CoreError> {
        let rows: Vec<MarketRow> = sqlx::query_as(&format!(
            "SELECT {MARKET_COLUMNS} FROM markets ORDER BY created_at DESC"
        ))
        .fetch_all(&self.db.pool)
        .await?;
        rows.into_iter().map(Market::try_from).collect()
    }

    fn emit_market_update(&self, market: &Market) {
        let channel = format!("orderbook:{}", market.id);
        self.hub.broadcast(
            &channel,
            OutboundMessage::event(
                &channel,
                "market_updated",
                serde_json::to_value(market).unwrap_or_default(),
            ),
        );
    }
}

pub async fn get_market(
    executor: &sqlx::SqlitePool,
    market_id: &str,
) -> Result<Option<Market>, CoreError> {
    let row: Option<MarketRow> =
        sqlx::query_as(&format!("SELECT {MARKET_COLUMNS} FROM markets WHERE id = ?1"))
            .bind(market_id)
            .fetch_optional(executor)
            .await?;
    row.map(Market::try_from).transpose()
}

/// Fold a batch of fresh trades into the market row: last-trade pricing,
/// rolling volumes, and open interest from minted pairs. Runs inside the
/// caller's placement transaction.
pub async fn apply_trade_stats(
    conn: &mut SqliteConnection,
    market_id: &str,
    trades: &[Trade],
) -> Result<(), CoreError> {
    let Some(last) = trades.last() else {
        return Ok(());
    };

    // Normalise the published price to the YES side.
    let yes_price = match last.side {
        OrderSide::Yes => last.price,
        OrderSide::No => Decimal::ONE - last.price,
    };
    let no_price = Decimal::ONE - yes_price;

    let traded: Decimal = trades.iter().map(|t| t.quantity).sum();
    let minted: Decimal = trades
        .iter()
        .filter(|t| t.trade_type == crate::models::TradeType::ShareCreation)
        .map(|t| t.quantity)
        .sum();

    let row: Option<(String, String)> =
        sqlx::query_as("SELECT total_volume, open_interest FROM markets WHERE id = ?1")
            .bind(market_id)
            .fetch_optional(&mut *conn)
            .await?;
    let (total_volume, open_interest) = match row {
        Some((tv, oi)) => (
            crate::models::decimal_col(&tv, "markets.total_volume")?,
            crate::models::decimal_col(&oi, "markets.open_interest")?,
        ),
        None => return Err(CoreError::market_not_found(market_id)),
    };

    // 24h volume is recomputed from the trade log rather than decayed.
    let cutoff = Utc::now() - chrono::Duration::hours(24);
    let day_rows: Vec<(String,)> =
        sqlx::query_as("SELECT quantity FROM trades WHERE market_id = ?1 AND created_at > ?2")
            .bind(market_id)
            .bind(cutoff)
            .fetch_all(&mut *conn)
            .await?;
    let mut volume_24h = Decimal::ZERO;
    for (qty,) in day_rows {
        volume_24h += crate::models::decimal_col(&qty, "trades.quantity")?;
    }

    sqlx::query(
        "UPDATE markets SET yes_price = ?1, no_price = ?2, volume_24h = ?3,
                total_volume = ?4, open_interest = ?5
         WHERE id = ?6",
    )
    .bind(yes_price.to_string())
    .bind(no_price.to_string())
    .bind(volume_24h.to_string())
    .bind((total_volume + traded).to_string())
    .bind((open_interest + minted).to_string())
    .bind(market_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
