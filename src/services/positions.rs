//! Position Store & Service
//!
//! Share holdings keyed by `(user, market, side)` while active, plus the
//! user-facing redemption and merge operations. Positions archive at zero
//! quantity; a later credit revives the key with a fresh row.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::Database;
use crate::errors::CoreError;
use crate::ledger::{templates, CommandRequest, LedgerClient};
use crate::models::{MarketStatus, OrderSide, Position, PositionRow};
use crate::services::balances::{self, BalanceRegistry};
use crate::ws::messages::OutboundMessage;
use crate::ws::SubscriptionHub;

const POSITION_COLUMNS: &str = "id, user_id, market_id, side, quantity, locked_quantity, \
                                avg_cost_basis, is_archived, contract_id, last_updated";

pub async fn get_active_position(
    conn: &mut SqliteConnection,
    user_id: &str,
    market_id: &str,
    side: OrderSide,
) -> Result<Option<Position>, CoreError> {
    let row: Option<PositionRow> = sqlx::query_as(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions
         WHERE user_id = ?1 AND market_id = ?2 AND side = ?3 AND is_archived = 0",
    ))
    .bind(user_id)
    .bind(market_id)
    .bind(side)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Position::try_from).transpose()
}

pub async fn list_positions(
    pool: &sqlx::SqlitePool,
    user_id: &str,
) -> Result<Vec<Position>, CoreError> {
    let rows: Vec<PositionRow> = sqlx::query_as(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions
         WHERE user_id = ?1 AND is_archived = 0 ORDER BY last_updated DESC",
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Position::try_from).collect()
}

/// Reserve shares against a sell order. Fails when the free quantity
/// (`quantity - locked_quantity`) cannot cover the request.
pub async fn lock_shares(
    conn: &mut SqliteConnection,
    user_id: &str,
    market_id: &str,
    side: OrderSide,
    quantity: Decimal,
) -> Result<Position, CoreError> {
    let position = get_active_position(conn, user_id, market_id, side)
        .await?
        .ok_or_else(|| CoreError::InsufficientPosition {
            required: quantity.to_string(),
            available: "0".to_string(),
        })?;

    if position.available() < quantity {
        return Err(CoreError::InsufficientPosition {
            required: quantity.to_string(),
            available: position.available().to_string(),
        });
    }

    update_quantities(
        conn,
        &position.id,
        position.quantity,
        position.locked_quantity + quantity,
        position.avg_cost_basis,
    )
    .await?;
    get_active_position(conn, user_id, market_id, side)
        .await?
        .ok_or_else(|| CoreError::Internal("position vanished during lock".into()))
}

pub async fn unlock_shares(
    conn: &mut SqliteConnection,
    user_id: &str,
    market_id: &str,
    side: OrderSide,
    quantity: Decimal,
) -> Result<(), CoreError> {
    let Some(position) = get_active_position(conn, user_id, market_id, side).await? else {
        return Ok(());
    };
    let locked = (position.locked_quantity - quantity).max(Decimal::ZERO);
    update_quantities(
        conn,
        &position.id,
        position.quantity,
        locked,
        position.avg_cost_basis,
    )
    .await
}

/// Add shares to a holding, blending the cost basis. Revives an archived
/// key with a fresh row.
pub async fn credit_shares(
    conn: &mut SqliteConnection,
    user_id: &str,
    market_id: &str,
    side: OrderSide,
    quantity: Decimal,
    price: Decimal,
) -> Result<(), CoreError> {
    match get_active_position(conn, user_id, market_id, side).await? {
        Some(position) => {
            let total = position.quantity + quantity;
            let basis = ((position.quantity * position.avg_cost_basis + quantity * price) / total)
                .round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero);
            update_quantities(conn, &position.id, total, position.locked_quantity, basis).await
        }
        None => {
            sqlx::query(
                "INSERT INTO positions (id, user_id, market_id, side, quantity, locked_quantity,
                                        avg_cost_basis, is_archived, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, '0', ?6, 0, ?7)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(user_id)
            .bind(market_id)
            .bind(side)
            .bind(quantity.to_string())
            .bind(price.to_string())
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
    }
}

/// Consume previously locked shares (a settled sell). Archives at zero.
pub async fn debit_locked_shares(
    conn: &mut SqliteConnection,
    user_id: &str,
    market_id: &str,
    side: OrderSide,
    quantity: Decimal,
) -> Result<(), CoreError> {
    let position = get_active_position(conn, user_id, market_id, side)
        .await?
        .ok_or_else(|| {
            CoreError::Internal(format!(
                "settled sell for missing position {user_id}/{market_id}/{side}"
            ))
        })?;

    if position.locked_quantity < quantity {
        return Err(CoreError::Internal(format!(
            "settled sell exceeds locked shares for {user_id}/{market_id}/{side}"
        )));
    }

    update_quantities(
        conn,
        &position.id,
        position.quantity - quantity,
        position.locked_quantity - quantity,
        position.avg_cost_basis,
    )
    .await
}

async fn update_quantities(
    conn: &mut SqliteConnection,
    position_id: &str,
    quantity: Decimal,
    locked_quantity: Decimal,
    avg_cost_basis: Decimal,
) -> Result<(), CoreError> {
    let archived = quantity <= Decimal::ZERO;
    sqlx::query(
        "UPDATE positions SET quantity = ?1, locked_quantity = ?2, avg_cost_basis = ?3,
                is_archived = ?4, last_updated = ?5
         WHERE id = ?6",
    )
    .bind(quantity.to_string())
    .bind(locked_quantity.to_string())
    .bind(avg_cost_basis.to_string())
    .bind(archived)
    .bind(Utc::now())
    .bind(position_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub struct PositionService {
    db: Database,
    ledger: Arc<dyn LedgerClient>,
    hub: Arc<SubscriptionHub>,
    balances: Arc<BalanceRegistry>,
}

impl PositionService {
    pub fn new(
        db: Database,
        ledger: Arc<dyn LedgerClient>,
        hub: Arc<SubscriptionHub>,
        balances: Arc<BalanceRegistry>,
    ) -> Self {
        Self {
            db,
            ledger,
            hub,
            balances,
        }
    }

    /// Redeem a winning position after resolution: 1.0 per share credited
    /// to the available balance, position archived.
    pub async fn redeem(&self, user_id: &str, market_id: &str) -> Result<Decimal, CoreError> {
        let market = super::markets::get_market(&self.db.pool, market_id)
            .await?
            .ok_or_else(|| CoreError::market_not_found(market_id))?;
        if market.status != MarketStatus::Resolved {
            return Err(CoreError::conflict(
                "MARKET_NOT_RESOLVED",
                format!("market {market_id} is not resolved"),
            ));
        }
        let winning_side = if market.outcome == Some(true) {
            OrderSide::Yes
        } else {
            OrderSide::No
        };

        let _guard = self.balances.lock(user_id).await;
        let mut tx = self.db.pool.begin().await?;

        let position = get_active_position(&mut tx, user_id, market_id, winning_side)
            .await?
            .filter(|p| p.quantity > Decimal::ZERO)
            .ok_or_else(|| {
                CoreError::NotFound(format!("position {user_id}/{market_id}/{winning_side}"))
            })?;
        if position.locked_quantity > Decimal::ZERO {
            return Err(CoreError::conflict(
                "POSITION_LOCKED",
                format!("{} shares are locked by open orders", position.locked_quantity),
            ));
        }

        // Winning shares pay out 1.0 each
        let payout = position.quantity;
        update_quantities(
            &mut tx,
            &position.id,
            Decimal::ZERO,
            Decimal::ZERO,
            position.avg_cost_basis,
        )
        .await?;
        let account = balances::adjust_balance(&mut tx, user_id, payout, Decimal::ZERO).await?;
        tx.commit().await?;

        // Ledger-side redemption is idempotent per user+market.
        let ledger = self.ledger.clone();
        let command = CommandRequest::exercise(
            format!("redeem-{user_id}-{market_id}"),
            user_id.to_string(),
            templates::MARKET_SETTLEMENT,
            market.contract_id.clone().unwrap_or_default(),
            "RedeemPosition",
            json!({ "owner": user_id, "marketId": market_id }),
        );
        tokio::spawn(async move {
            if let Err(e) = ledger.submit_command(command).await {
                tracing::warn!("RedeemPosition submission failed: {e}");
            }
        });

        self.emit_position_update(user_id, market_id, winning_side).await;
        self.hub.send_to_user(
            user_id,
            "balance",
            OutboundMessage::event(
                "balance",
                "balance_updated",
                json!({
                    "userId": user_id,
                    "available": account.available_balance.to_string(),
                    "locked": account.locked_balance.to_string(),
                }),
            ),
        );

        tracing::info!(user = user_id, market = market_id, %payout, "position redeemed");
        Ok(payout)
    }

    /// Burn a matched YES/NO pair for 1.0 collateral per pair.
    pub async fn merge(
        &self,
        user_id: &str,
        market_id: &str,
        quantity: Decimal,
    ) -> Result<Decimal, CoreError> {
        if quantity <= Decimal::ZERO {
            return Err(CoreError::validation(
                "INVALID_QUANTITY",
                "merge quantity must be positive",
            ));
        }

        let _guard = self.balances.lock(user_id).await;
        let mut tx = self.db.pool.begin().await?;

        for side in [OrderSide::Yes, OrderSide::No] {
            let free = get_active_position(&mut tx, user_id, market_id, side)
                .await?
                .map(|p| p.available())
                .unwrap_or(Decimal::ZERO);
            if free < quantity {
                return Err(CoreError::InsufficientPosition {
                    required: quantity.to_string(),
                    available: free.to_string(),
                });
            }
        }

        for side in [OrderSide::Yes, OrderSide::No] {
            let position = get_active_position(&mut tx, user_id, market_id, side)
                .await?
                .ok_or_else(|| CoreError::Internal("position vanished during merge".into()))?;
            update_quantities(
                &mut tx,
                &position.id,
                position.quantity - quantity,
                position.locked_quantity,
                position.avg_cost_basis,
            )
            .await?;
        }

        let proceeds = quantity;
        let account = balances::adjust_balance(&mut tx, user_id, proceeds, Decimal::ZERO).await?;

        // Burned pairs shrink open interest
        let row: Option<(String,)> =
            sqlx::query_as("SELECT open_interest FROM markets WHERE id = ?1")
                .bind(market_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (open_interest,) = row.ok_or_else(|| CoreError::market_not_found(market_id))?;
        let open_interest = crate::models::decimal_col(&open_interest, "markets.open_interest")?;
        sqlx::query("UPDATE markets SET open_interest = ?1 WHERE id = ?2")
            .bind((open_interest - quantity).max(Decimal::ZERO).to_string())
            .bind(market_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        // Mirror on the ledger: create the PositionMerge contract, then
        // exercise ExecuteMerge on it, like the account request/accept flow.
        let ledger = self.ledger.clone();
        let owner = user_id.to_string();
        let market = market_id.to_string();
        tokio::spawn(async move {
            let create = CommandRequest::create(
                format!("merge-request-{owner}-{market}-{quantity}"),
                owner.clone(),
                templates::POSITION_MERGE,
                json!({
                    "owner": owner,
                    "marketId": market,
                    "quantity": quantity.to_string(),
                }),
            );
            let contract_id = match ledger.submit_command(create).await {
                Ok(result) => result.contract_id,
                Err(e) => {
                    tracing::warn!("PositionMerge creation failed: {e}");
                    return;
                }
            };
            let Some(contract_id) = contract_id else {
                tracing::warn!("PositionMerge creation returned no contract id");
                return;
            };
            let execute = CommandRequest::exercise(
                format!("merge-execute-{owner}-{market}-{quantity}"),
                owner.clone(),
                templates::POSITION_MERGE,
                contract_id,
                "ExecuteMerge",
                json!({}),
            );
            if let Err(e) = ledger.submit_command(execute).await {
                tracing::warn!("ExecuteMerge submission failed: {e}");
            }
        });

        for side in [OrderSide::Yes, OrderSide::No] {
            self.emit_position_update(user_id, market_id, side).await;
        }
        self.hub.send_to_user(
            user_id,
            "balance",
            OutboundMessage::event(
                "balance",
                "balance_updated",
                json!({
                    "userId": user_id,
                    "available": account.available_balance.to_string(),
                    "locked": account.locked_balance.to_string(),
                }),
            ),
        );

        Ok(proceeds)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Position>, CoreError> {
        list_positions(&self.db.pool, user_id).await
    }

    async fn emit_position_update(&self, user_id: &str, market_id: &str, side: OrderSide) {
        let mut conn = match self.db.pool.acquire().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let payload = match get_active_position(&mut conn, user_id, market_id, side).await {
            Ok(Some(position)) => serde_json::to_value(&position).unwrap_or_default(),
            _ => json!({
                "userId": user_id,
                "marketId": market_id,
                "side": side.to_string(),
                "quantity": "0",
                "isArchived": true,
            }),
        };
        self.hub.send_to_user(
            user_id,
            "positions",
            OutboundMessage::event("positions", "position_updated", payload),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::MockLedger;
    use rust_decimal_macros::dec;

    async fn setup() -> (Database, PositionService) {
        let db = Database::connect_in_memory().await.unwrap();
        let service = PositionService::new(
            db.clone(),
            Arc::new(MockLedger::new()),
            Arc::new(SubscriptionHub::new()),
            Arc::new(BalanceRegistry::new()),
        );
        (db, service)
    }

    async fn seed_market(db: &Database, id: &str, status: &str, outcome: Option<bool>) {
        sqlx::query(
            "INSERT INTO markets (id, question, resolution_time, created_at, status, outcome)
             VALUES (?1, 'q', ?2, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(Utc::now())
        .bind(status)
        .bind(outcome)
        .execute(&db.pool)
        .await
        .unwrap();
    }

    async fn seed_account(db: &Database, user: &str, available: Decimal) {
        sqlx::query(
            "INSERT INTO accounts (user_id, party_id, available_balance, locked_balance, last_updated)
             VALUES (?1, ?1, ?2, '0', ?3)",
        )
        .bind(user)
        .bind(available.to_string())
        .bind(Utc::now())
        .execute(&db.pool)
        .await
        .unwrap();
    }

    async fn seed_position(db: &Database, user: &str, market: &str, side: OrderSide, qty: Decimal) {
        let mut conn = db.pool.acquire().await.unwrap();
        credit_shares(&mut conn, user, market, side, qty, dec!(0.5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_redeem_winning_position() {
        let (db, service) = setup().await;
        seed_market(&db, "mkt-1", "resolved", Some(true)).await;
        seed_account(&db, "alice", dec!(0)).await;
        seed_position(&db, "alice", "mkt-1", OrderSide::Yes, dec!(5)).await;

        let payout = service.redeem("alice", "mkt-1").await.unwrap();
        assert_eq!(payout, dec!(5));

        let mut conn = db.pool.acquire().await.unwrap();
        // Archived at zero
        assert!(get_active_position(&mut conn, "alice", "mkt-1", OrderSide::Yes)
            .await
            .unwrap()
            .is_none());
        let account = balances::get_account(&mut conn, "alice").await.unwrap().unwrap();
        assert_eq!(account.available_balance, dec!(5));
    }

    #[tokio::test]
    async fn test_redeem_requires_resolution() {
        let (db, service) = setup().await;
        seed_market(&db, "mkt-1", "open", None).await;
        seed_account(&db, "alice", dec!(0)).await;
        seed_position(&db, "alice", "mkt-1", OrderSide::Yes, dec!(5)).await;

        let err = service.redeem("alice", "mkt-1").await.unwrap_err();
        assert_eq!(err.code(), "MARKET_NOT_RESOLVED");
    }

    #[tokio::test]
    async fn test_redeem_losing_side_not_found() {
        let (db, service) = setup().await;
        seed_market(&db, "mkt-1", "resolved", Some(false)).await;
        seed_account(&db, "alice", dec!(0)).await;
        seed_position(&db, "alice", "mkt-1", OrderSide::Yes, dec!(5)).await;

        // Outcome false: YES holding pays nothing, NO would win
        let err = service.redeem("alice", "mkt-1").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_merge_burns_pair_for_collateral() {
        let (db, service) = setup().await;
        seed_market(&db, "mkt-1", "open", None).await;
        seed_account(&db, "alice", dec!(0)).await;
        seed_position(&db, "alice", "mkt-1", OrderSide::Yes, dec!(4)).await;
        seed_position(&db, "alice", "mkt-1", OrderSide::No, dec!(7)).await;

        let proceeds = service.merge("alice", "mkt-1", dec!(4)).await.unwrap();
        assert_eq!(proceeds, dec!(4));

        let mut conn = db.pool.acquire().await.unwrap();
        assert!(get_active_position(&mut conn, "alice", "mkt-1", OrderSide::Yes)
            .await
            .unwrap()
            .is_none());
        let no_pos = get_active_position(&mut conn, "alice", "mkt-1", OrderSide::No)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(no_pos.quantity, dec!(3));
        let account = balances::get_account(&mut conn, "alice").await.unwrap().unwrap();
        assert_eq!(account.available_balance, dec!(4));
    }

    #[tokio::test]
    async fn test_merge_requires_both_sides() {
        let (db, service) = setup().await;
        seed_market(&db, "mkt-1", "open", None).await;
        seed_account(&db, "alice", dec!(0)).await;
        seed_position(&db, "alice", "mkt-1", OrderSide::Yes, dec!(4)).await;

        let err = service.merge("alice", "mkt-1", dec!(1)).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_POSITIONS");
    }

    #[tokio::test]
    async fn test_lock_respects_free_quantity() {
        let (db, _service) = setup().await;
        seed_market(&db, "mkt-1", "open", None).await;
        seed_position(&db, "alice", "mkt-1", OrderSide::Yes, dec!(10)).await;

        let mut conn = db.pool.acquire().await.unwrap();
        lock_shares(&mut conn, "alice", "mkt-1", OrderSide::Yes, dec!(6))
            .await
            .unwrap();
        let err = lock_shares(&mut conn, "alice", "mkt-1", OrderSide::Yes, dec!(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_POSITIONS");
    }
}
