//! Settlement Batcher
//!
//! Drains pending trades into batches and drives each through the
//! three-phase ledger exchange: proposing → accepting → executing. A batch
//! failure demotes its trades back to `pending` until the retry budget is
//! spent, after which the trades fail terminally and the locked funds are
//! compensated off-chain for manual review.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::SqliteConnection;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::db::Database;
use crate::errors::CoreError;
use crate::ledger::{templates, CommandRequest, CommandResult, LedgerClient, LedgerError};
use crate::models::{BatchStatus, OrderSide, Trade, TradeRow, TradeType};
use crate::services::balances::{self, BalanceRegistry};
use crate::services::positions;
use crate::ws::messages::OutboundMessage;
use crate::ws::SubscriptionHub;

const TRADE_COLUMNS: &str = "id, market_id, buyer_id, seller_id, side, price, quantity, \
                             buyer_order_id, seller_order_id, trade_type, settlement_status, \
                             settlement_id, created_at, settled_at";

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatcherStatus {
    pub is_running: bool,
    pub batches_processed: u64,
    pub trades_settled: u64,
    pub failures: u64,
}

pub struct SettlementBatcher {
    db: Database,
    ledger: Arc<dyn LedgerClient>,
    hub: Arc<SubscriptionHub>,
    balances: Arc<BalanceRegistry>,
    config: SettlementConfig,
    admin_party: String,
    running: AtomicBool,
    batches_processed: AtomicU64,
    trades_settled: AtomicU64,
    failures: AtomicU64,
}

impl SettlementBatcher {
    pub fn new(
        db: Database,
        ledger: Arc<dyn LedgerClient>,
        hub: Arc<SubscriptionHub>,
        balances: Arc<BalanceRegistry>,
        config: SettlementConfig,
        admin_party: String,
    ) -> Self {
        Self {
            db,
            ledger,
            hub,
            balances,
            config,
            admin_party,
            running: AtomicBool::new(false),
            batches_processed: AtomicU64::new(0),
            trades_settled: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> BatcherStatus {
        BatcherStatus {
            is_running: self.running.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            trades_settled: self.trades_settled.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Worker loop. Stop is observed between ticks, so an in-flight batch
    /// always finishes its current phase before shutdown.
    pub fn start(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.running.store(true, Ordering::Relaxed);
            let mut ticker =
                tokio::time::interval(Duration::from_millis(self.config.batch_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                interval_ms = self.config.batch_interval_ms,
                "settlement batcher started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_tick().await {
                            self.failures.fetch_add(1, Ordering::Relaxed);
                            tracing::error!("settlement tick failed: {e}");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            self.running.store(false, Ordering::Relaxed);
            tracing::info!("settlement batcher stopped");
        })
    }

    /// One batching round. Public so tests can drive it deterministically.
    pub async fn run_tick(&self) -> Result<Option<Uuid>, CoreError> {
        let trades = self.fetch_pending_trades().await?;
        if trades.is_empty() {
            return Ok(None);
        }

        let batch_id = Uuid::new_v4();
        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "INSERT INTO settlement_batches (id, status, created_at) VALUES (?1, 'pending', ?2)",
        )
        .bind(batch_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        for trade in &trades {
            sqlx::query("INSERT INTO settlement_batch_trades (batch_id, trade_id) VALUES (?1, ?2)")
                .bind(batch_id.to_string())
                .bind(trade.id.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE trades SET settlement_status = 'settling', settlement_id = ?1 WHERE id = ?2",
            )
            .bind(batch_id.to_string())
            .bind(trade.id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(batch = %batch_id, trades = trades.len(), "settlement batch assembled");
        self.process_batch(batch_id, &trades).await?;
        Ok(Some(batch_id))
    }

    /// Ledger calls carry a per-call timeout; a timeout counts as a phase
    /// failure for retry accounting.
    async fn submit(&self, command: CommandRequest) -> Result<CommandResult, LedgerError> {
        let timeout = Duration::from_millis(self.config.proposal_timeout_ms);
        match tokio::time::timeout(timeout, self.ledger.submit_command(command)).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Unavailable("settlement command timed out".into())),
        }
    }

    async fn fetch_pending_trades(&self) -> Result<Vec<Trade>, CoreError> {
        let rows: Vec<TradeRow> = sqlx::query_as(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades
             WHERE settlement_status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM settlement_batch_trades sbt
                   JOIN settlement_batches b ON b.id = sbt.batch_id
                   WHERE sbt.trade_id = trades.id AND b.status != 'failed'
               )
             ORDER BY created_at ASC
             LIMIT ?1",
        ))
        .bind(self.config.max_batch_size as i64)
        .fetch_all(&self.db.pool)
        .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    async fn process_batch(&self, batch_id: Uuid, trades: &[Trade]) -> Result<(), CoreError> {
        // Phase 1: proposing, one proposal per distinct counterparty pair
        self.set_batch_status(batch_id, BatchStatus::Proposing, None).await?;
        let mut pairs: Vec<(String, String)> = trades
            .iter()
            .map(|t| (t.buyer_id.clone(), t.seller_id.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();

        for (n, (buyer, seller)) in pairs.iter().enumerate() {
            let command = CommandRequest::create(
                format!("settle-{batch_id}-prop-{n}"),
                self.admin_party.clone(),
                templates::SETTLEMENT_PROPOSAL,
                json!({
                    "buyer": buyer,
                    "seller": seller,
                    "batchId": batch_id,
                    "tradeIds": trades
                        .iter()
                        .filter(|t| &t.buyer_id == buyer && &t.seller_id == seller)
                        .map(|t| t.id.to_string())
                        .collect::<Vec<_>>(),
                }),
            );
            if let Err(e) = self.submit(command).await {
                return self.fail_batch(batch_id, trades, "proposing", &e.to_string()).await;
            }
        }
        tokio::time::sleep(Duration::from_millis(self.config.round_delay_ms)).await;

        // Phase 2: accepting, buyer and seller acceptance per pair
        self.set_batch_status(batch_id, BatchStatus::Accepting, None).await?;
        for (n, (buyer, seller)) in pairs.iter().enumerate() {
            for (role, party) in [("buyer", buyer), ("seller", seller)] {
                let choice = if role == "buyer" { "BuyerAccept" } else { "SellerAccept" };
                let command = CommandRequest::exercise(
                    format!("settle-{batch_id}-accept-{n}-{role}"),
                    party.clone(),
                    templates::SETTLEMENT_PROPOSAL,
                    format!("settlement-proposal-{batch_id}-{n}"),
                    choice,
                    json!({}),
                );
                if let Err(e) = self.submit(command).await {
                    return self.fail_batch(batch_id, trades, "accepting", &e.to_string()).await;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(self.config.round_delay_ms)).await;

        // Phase 3: executing
        self.set_batch_status(batch_id, BatchStatus::Executing, None).await?;
        let command = CommandRequest::exercise(
            format!("settle-{batch_id}-exec"),
            self.admin_party.clone(),
            templates::SETTLEMENT,
            format!("settlement-{batch_id}"),
            "ExecuteSettlement",
            json!({ "batchId": batch_id }),
        );
        if let Err(e) = self.submit(command).await {
            return self.fail_batch(batch_id, trades, "executing", &e.to_string()).await;
        }

        self.complete_batch(batch_id, trades).await
    }

    /// Apply the economic effects of a settled batch and mark everything
    /// settled, all in one store transaction.
    async fn complete_batch(&self, batch_id: Uuid, trades: &[Trade]) -> Result<(), CoreError> {
        let users: Vec<&str> = trades
            .iter()
            .flat_map(|t| [t.buyer_id.as_str(), t.seller_id.as_str()])
            .collect();
        let _guards = self.balances.lock_many(&users).await;

        let mut tx = self.db.pool.begin().await?;
        let now = Utc::now();
        for trade in trades {
            apply_settled_trade(&mut tx, trade).await?;
            sqlx::query(
                "UPDATE trades SET settlement_status = 'settled', settled_at = ?1 WHERE id = ?2",
            )
            .bind(now)
            .bind(trade.id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE settlement_batches SET status = 'completed', processed_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;
        record_batch_event(&mut tx, batch_id, BatchStatus::Completed, None).await?;
        tx.commit().await?;

        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.trades_settled.fetch_add(trades.len() as u64, Ordering::Relaxed);
        for trade in trades {
            self.emit_settlement_events(trade);
        }
        tracing::info!(batch = %batch_id, trades = trades.len(), "settlement batch completed");
        Ok(())
    }

    async fn fail_batch(
        &self,
        batch_id: Uuid,
        trades: &[Trade],
        phase: &str,
        error: &str,
    ) -> Result<(), CoreError> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(batch = %batch_id, phase, error, "settlement batch failed");

        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "UPDATE settlement_batches SET status = 'failed', last_error = ?1,
                    retry_count = retry_count + 1, processed_at = ?2
             WHERE id = ?3",
        )
        .bind(format!("{phase}: {error}"))
        .bind(Utc::now())
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;
        record_batch_event(&mut tx, batch_id, BatchStatus::Failed, Some(error)).await?;
        tx.commit().await?;

        // A trade's retry count is its membership in failed batches.
        let mut exhausted = Vec::new();
        for trade in trades {
            let (failed_batches,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM settlement_batch_trades sbt
                 JOIN settlement_batches b ON b.id = sbt.batch_id
                 WHERE sbt.trade_id = ?1 AND b.status = 'failed'",
            )
            .bind(trade.id.to_string())
            .fetch_one(&self.db.pool)
            .await?;

            if (failed_batches as u32) < self.config.max_retries {
                sqlx::query(
                    "UPDATE trades SET settlement_status = 'pending', settlement_id = NULL
                     WHERE id = ?1",
                )
                .bind(trade.id.to_string())
                .execute(&self.db.pool)
                .await?;
            } else {
                sqlx::query("UPDATE trades SET settlement_status = 'failed' WHERE id = ?1")
                    .bind(trade.id.to_string())
                    .execute(&self.db.pool)
                    .await?;
                exhausted.push(trade);
            }
        }

        if !exhausted.is_empty() {
            self.compensate(batch_id, &exhausted).await?;
        }
        Ok(())
    }

    /// Off-chain rollback after a terminal failure: release the buyers'
    /// locked funds and the seller's locked shares, and log every released
    /// leg for operator review. Idempotent via the unique compensation row.
    async fn compensate(&self, batch_id: Uuid, trades: &[&Trade]) -> Result<(), CoreError> {
        let users: Vec<&str> = trades
            .iter()
            .flat_map(|t| [t.buyer_id.as_str(), t.seller_id.as_str()])
            .collect();
        let _guards = self.balances.lock_many(&users).await;

        let mut tx = self.db.pool.begin().await?;
        for trade in trades {
            for (user, amount, reason) in compensation_legs(trade) {
                let inserted = sqlx::query(
                    "INSERT INTO compensation_failures (batch_id, trade_id, user_id, amount, reason, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (batch_id, trade_id, user_id) DO NOTHING",
                )
                .bind(batch_id.to_string())
                .bind(trade.id.to_string())
                .bind(&user)
                .bind(amount.to_string())
                .bind(&reason)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;

                // Only release on first insertion; replays are no-ops
                if inserted.rows_affected() == 0 {
                    continue;
                }
                if amount > Decimal::ZERO {
                    balances::unlock_funds(&mut tx, &user, amount).await?;
                }
            }
            if trade.trade_type == TradeType::ShareTrade {
                positions::unlock_shares(
                    &mut tx,
                    &trade.seller_id,
                    &trade.market_id,
                    trade.side,
                    trade.quantity,
                )
                .await?;
            }
            tracing::error!(
                batch = %batch_id,
                trade = %trade.id,
                "trade failed terminally, compensation recorded"
            );
        }
        tx.commit().await?;

        for trade in trades {
            self.emit_settlement_events(trade);
        }
        Ok(())
    }

    async fn set_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        detail: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut tx = self.db.pool.begin().await?;
        sqlx::query("UPDATE settlement_batches SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(batch_id.to_string())
            .execute(&mut *tx)
            .await?;
        record_batch_event(&mut tx, batch_id, status, detail).await?;
        tx.commit().await?;
        Ok(())
    }

    fn emit_settlement_events(&self, trade: &Trade) {
        for user in [&trade.buyer_id, &trade.seller_id] {
            self.hub.send_to_user(
                user,
                "balance",
                OutboundMessage::event(
                    "balance",
                    "settlement",
                    json!({ "tradeId": trade.id, "marketId": trade.market_id }),
                ),
            );
            self.hub.send_to_user(
                user,
                "positions",
                OutboundMessage::event(
                    "positions",
                    "settlement",
                    json!({ "tradeId": trade.id, "marketId": trade.market_id }),
                ),
            );
            self.hub.send_to_user(
                user,
                "orders",
                OutboundMessage::event(
                    "orders",
                    "settlement",
                    json!({ "tradeId": trade.id, "marketId": trade.market_id }),
                ),
            );
        }
    }
}

/// The locked funds each party committed to a trade.
fn compensation_legs(trade: &Trade) -> Vec<(String, Decimal, String)> {
    match trade.trade_type {
        TradeType::ShareTrade => vec![(
            trade.buyer_id.clone(),
            trade.price * trade.quantity,
            "buy funds released after terminal settlement failure".to_string(),
        )],
        TradeType::ShareCreation => vec![
            (
                trade.buyer_id.clone(),
                trade.price * trade.quantity,
                "yes-side funds released after terminal settlement failure".to_string(),
            ),
            (
                trade.seller_id.clone(),
                (Decimal::ONE - trade.price) * trade.quantity,
                "no-side funds released after terminal settlement failure".to_string(),
            ),
        ],
    }
}

/// Move value for one settled trade: debit locked funds, transfer or mint
/// shares, and shrink the participating orders' locked amounts.
async fn apply_settled_trade(conn: &mut SqliteConnection, trade: &Trade) -> Result<(), CoreError> {
    match trade.trade_type {
        TradeType::ShareTrade => {
            let notional = trade.price * trade.quantity;
            // Buyer: escrowed funds leave the locked bucket, shares arrive
            balances::adjust_balance(conn, &trade.buyer_id, Decimal::ZERO, -notional).await?;
            positions::credit_shares(
                conn,
                &trade.buyer_id,
                &trade.market_id,
                trade.side,
                trade.quantity,
                trade.price,
            )
            .await?;
            // Seller: locked shares leave, proceeds arrive
            positions::debit_locked_shares(
                conn,
                &trade.seller_id,
                &trade.market_id,
                trade.side,
                trade.quantity,
            )
            .await?;
            balances::adjust_balance(conn, &trade.seller_id, notional, Decimal::ZERO).await?;

            reduce_order_lock(conn, trade.buyer_order_id, notional).await?;
        }
        TradeType::ShareCreation => {
            let yes_cost = trade.price * trade.quantity;
            let no_cost = (Decimal::ONE - trade.price) * trade.quantity;
            balances::adjust_balance(conn, &trade.buyer_id, Decimal::ZERO, -yes_cost).await?;
            positions::credit_shares(
                conn,
                &trade.buyer_id,
                &trade.market_id,
                OrderSide::Yes,
                trade.quantity,
                trade.price,
            )
            .await?;
            balances::adjust_balance(conn, &trade.seller_id, Decimal::ZERO, -no_cost).await?;
            positions::credit_shares(
                conn,
                &trade.seller_id,
                &trade.market_id,
                OrderSide::No,
                trade.quantity,
                Decimal::ONE - trade.price,
            )
            .await?;

            reduce_order_lock(conn, trade.buyer_order_id, yes_cost).await?;
            reduce_order_lock(conn, trade.seller_order_id, no_cost).await?;
        }
    }
    Ok(())
}

async fn reduce_order_lock(
    conn: &mut SqliteConnection,
    order_id: Uuid,
    amount: Decimal,
) -> Result<(), CoreError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT locked_amount FROM orders WHERE id = ?1")
        .bind(order_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    let Some((locked,)) = row else {
        return Ok(());
    };
    let locked = crate::models::decimal_col(&locked, "orders.locked_amount")?;
    let next = (locked - amount).max(Decimal::ZERO);
    sqlx::query("UPDATE orders SET locked_amount = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(next.to_string())
        .bind(Utc::now())
        .bind(order_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn record_batch_event(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    status: BatchStatus,
    detail: Option<&str>,
) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO settlement_events (batch_id, status, detail, created_at)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(batch_id.to_string())
    .bind(status)
    .bind(detail)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::MockLedger;
    use rust_decimal_macros::dec;

    struct Harness {
        db: Database,
        ledger: Arc<MockLedger>,
        batcher: SettlementBatcher,
    }

    async fn setup(max_retries: u32) -> Harness {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = Arc::new(MockLedger::new());
        let config = SettlementConfig {
            batch_interval_ms: 10,
            max_batch_size: 10,
            max_retries,
            proposal_timeout_ms: 100,
            round_delay_ms: 0,
        };
        let batcher = SettlementBatcher::new(
            db.clone(),
            ledger.clone(),
            Arc::new(SubscriptionHub::new()),
            Arc::new(BalanceRegistry::new()),
            config,
            "admin".to_string(),
        );

        sqlx::query(
            "INSERT INTO markets (id, question, resolution_time, created_at, status)
             VALUES ('mkt-1', 'q', ?1, ?1, 'open')",
        )
        .bind(Utc::now())
        .execute(&db.pool)
        .await
        .unwrap();

        Harness { db, ledger, batcher }
    }

    async fn seed_account(db: &Database, user: &str, available: Decimal, locked: Decimal) {
        sqlx::query(
            "INSERT INTO accounts (user_id, party_id, available_balance, locked_balance, last_updated)
             VALUES (?1, ?1, ?2, ?3, ?4)",
        )
        .bind(user)
        .bind(available.to_string())
        .bind(locked.to_string())
        .bind(Utc::now())
        .execute(&db.pool)
        .await
        .unwrap();
    }

    /// Insert a pending share_creation trade with both sides' funds locked.
    async fn seed_creation_trade(h: &Harness, price: Decimal, qty: Decimal) -> Uuid {
        let yes_cost = price * qty;
        let no_cost = (Decimal::ONE - price) * qty;
        seed_account(&h.db, "alice", dec!(100) - yes_cost, yes_cost).await;
        seed_account(&h.db, "bob", dec!(100) - no_cost, no_cost).await;

        let trade_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO trades (id, market_id, buyer_id, seller_id, side, price, quantity,
                                 buyer_order_id, seller_order_id, trade_type, settlement_status, created_at)
             VALUES (?1, 'mkt-1', 'alice', 'bob', 'yes', ?2, ?3, ?4, ?5, 'share_creation', 'pending', ?6)",
        )
        .bind(trade_id.to_string())
        .bind(price.to_string())
        .bind(qty.to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now())
        .execute(&h.db.pool)
        .await
        .unwrap();
        trade_id
    }

    async fn trade_status(db: &Database, trade_id: Uuid) -> String {
        let (status,): (String,) =
            sqlx::query_as("SELECT settlement_status FROM trades WHERE id = ?1")
                .bind(trade_id.to_string())
                .fetch_one(&db.pool)
                .await
                .unwrap();
        status
    }

    #[tokio::test]
    async fn test_successful_batch_settles_creation_trade() {
        let h = setup(3).await;
        let trade_id = seed_creation_trade(&h, dec!(0.70), dec!(5)).await;

        let batch_id = h.batcher.run_tick().await.unwrap().expect("batch created");
        assert_eq!(trade_status(&h.db, trade_id).await, "settled");

        // Locked collateral consumed on both sides, shares minted
        let mut conn = h.db.pool.acquire().await.unwrap();
        let alice = balances::get_account(&mut conn, "alice").await.unwrap().unwrap();
        assert_eq!(alice.locked_balance, dec!(0));
        assert_eq!(alice.available_balance, dec!(96.50));
        let bob = balances::get_account(&mut conn, "bob").await.unwrap().unwrap();
        assert_eq!(bob.locked_balance, dec!(0));

        let alice_yes =
            positions::get_active_position(&mut conn, "alice", "mkt-1", OrderSide::Yes)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(alice_yes.quantity, dec!(5));
        let bob_no = positions::get_active_position(&mut conn, "bob", "mkt-1", OrderSide::No)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob_no.quantity, dec!(5));
        drop(conn);

        // Three-phase command trail
        let ids = h.ledger.submitted_command_ids();
        assert!(ids.iter().any(|id| id.contains("prop")));
        assert!(ids.iter().any(|id| id.contains("accept")));
        assert!(ids.iter().any(|id| id == &format!("settle-{batch_id}-exec")));

        // Batch row completed
        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM settlement_batches WHERE id = ?1")
                .bind(batch_id.to_string())
                .fetch_one(&h.db.pool)
                .await
                .unwrap();
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    async fn test_failed_batch_demotes_trades_for_retry() {
        let h = setup(3).await;
        let trade_id = seed_creation_trade(&h, dec!(0.60), dec!(2)).await;

        h.ledger.fail_next_submits(1);
        h.batcher.run_tick().await.unwrap();

        // Back to pending for a later tick
        assert_eq!(trade_status(&h.db, trade_id).await, "pending");

        // Next tick succeeds and settles
        h.batcher.run_tick().await.unwrap();
        assert_eq!(trade_status(&h.db, trade_id).await, "settled");
    }

    #[tokio::test]
    async fn test_retry_exhaustion_triggers_compensation() {
        let h = setup(1).await;
        let trade_id = seed_creation_trade(&h, dec!(0.70), dec!(5)).await;

        // Every submit fails; one failed batch exhausts max_retries = 1
        h.ledger.fail_next_submits(100);
        h.batcher.run_tick().await.unwrap();

        assert_eq!(trade_status(&h.db, trade_id).await, "failed");

        // Compensation rows exist and the locks were released
        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM compensation_failures")
            .fetch_one(&h.db.pool)
            .await
            .unwrap();
        assert_eq!(rows, 2);

        let mut conn = h.db.pool.acquire().await.unwrap();
        let alice = balances::get_account(&mut conn, "alice").await.unwrap().unwrap();
        assert_eq!(alice.available_balance, dec!(100));
        assert_eq!(alice.locked_balance, dec!(0));
        let bob = balances::get_account(&mut conn, "bob").await.unwrap().unwrap();
        assert_eq!(bob.available_balance, dec!(100));
    }

    #[tokio::test]
    async fn test_trade_in_live_batch_not_rebatched() {
        let h = setup(3).await;
        let trade_id = seed_creation_trade(&h, dec!(0.50), dec!(1)).await;

        h.batcher.run_tick().await.unwrap();
        assert_eq!(trade_status(&h.db, trade_id).await, "settled");

        // Nothing pending: next tick is a no-op
        assert!(h.batcher.run_tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_tick_is_noop() {
        let h = setup(3).await;
        assert!(h.batcher.run_tick().await.unwrap().is_none());
        assert_eq!(h.batcher.status().batches_processed, 0);
    }
}
