//! Order Lifecycle Service
//!
//! Orchestrates placement end to end: validation, idempotency, fund and
//! position locking, the per-market match → persist → emit critical
//! section, cancellation, and crash recovery. All durable writes for one
//! placement land in a single store transaction; if that transaction
//! fails after the in-memory book mutated, the book is rebuilt from
//! durable orders.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::SqliteConnection;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::Database;
use crate::errors::CoreError;
use crate::ledger::{templates, CommandRequest, LedgerClient};
use crate::models::{
    MarketStatus, Order, OrderAction, OrderFilters, OrderRow, OrderStatus, OrderType,
    PlaceOrderRequest, PlaceResult, Trade,
};
use crate::services::balances::{self, BalanceRegistry};
use crate::services::matching::{self, IncomingOrder};
use crate::services::orderbook::{BookSide, BookSnapshot, OrderBook};
use crate::services::{markets, positions};
use crate::ws::messages::OutboundMessage;
use crate::ws::SubscriptionHub;

const ORDER_COLUMNS: &str = "id, market_id, user_id, side, action, order_type, price, quantity, \
                             filled_quantity, status, locked_amount, idempotency_key, \
                             created_at, updated_at";

const IDEMPOTENCY_TTL_HOURS: i64 = 24;

fn max_order_quantity() -> Decimal {
    Decimal::from(1_000_000u32)
}

fn min_price() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn max_price() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

/// Orders restored and excluded during startup rehydration.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub restored: usize,
    /// Resting orders left off the book because a trade of theirs is still
    /// pending or settling; re-matching them could double-settle.
    pub excluded: Vec<Uuid>,
}

pub struct OrderService {
    db: Database,
    ledger: Arc<dyn LedgerClient>,
    hub: Arc<SubscriptionHub>,
    balances: Arc<BalanceRegistry>,
    books: DashMap<String, Arc<RwLock<OrderBook>>>,
    market_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OrderService {
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
            books: DashMap::new(),
            market_locks: DashMap::new(),
        }
    }

    fn book(&self, market_id: &str) -> Arc<RwLock<OrderBook>> {
        self.books
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::new(market_id))))
            .clone()
    }

    fn market_lock(&self, market_id: &str) -> Arc<Mutex<()>> {
        self.market_locks
            .entry(market_id.to_string())
            .or_default()
            .clone()
    }

    pub fn orderbook_snapshot(&self, market_id: &str) -> BookSnapshot {
        self.book(market_id).read().snapshot()
    }

    // ========================================================================
    // Startup rehydration
    // ========================================================================

    /// Rebuild every book from durable orders. Orders referenced by a
    /// trade that is still `pending`/`settling` stay off the book and are
    /// reported for manual review.
    pub async fn initialize(&self) -> Result<RecoveryReport, CoreError> {
        let excluded_rows: Vec<(String,)> = sqlx::query_as(
            "SELECT o.id FROM orders o
             WHERE o.status IN ('open', 'partial')
               AND EXISTS (
                   SELECT 1 FROM trades t
                   WHERE (t.buyer_order_id = o.id OR t.seller_order_id = o.id)
                     AND t.settlement_status IN ('pending', 'settling')
               )",
        )
        .fetch_all(&self.db.pool)
        .await?;
        let mut excluded = Vec::with_capacity(excluded_rows.len());
        for (id,) in excluded_rows {
            let id = crate::models::uuid_col(&id, "orders.id")?;
            tracing::warn!(order = %id, "excluding order from rehydration: unsettled trades");
            excluded.push(id);
        }

        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders o
             WHERE o.status IN ('open', 'partial')
               AND NOT EXISTS (
                   SELECT 1 FROM trades t
                   WHERE (t.buyer_order_id = o.id OR t.seller_order_id = o.id)
                     AND t.settlement_status IN ('pending', 'settling')
               )
             ORDER BY o.created_at ASC",
        ))
        .fetch_all(&self.db.pool)
        .await?;

        let mut restored = 0;
        for row in rows {
            let order = Order::try_from(row)?;
            let book = self.book(&order.market_id);
            // Direct insertion, no re-matching
            book.write().add_order((&order).try_into()?)?;
            restored += 1;
        }

        tracing::info!(restored, excluded = excluded.len(), "orderbooks rehydrated");
        Ok(RecoveryReport { restored, excluded })
    }

    async fn rebuild_book(&self, market_id: &str) {
        let rows: Result<Vec<OrderRow>, _> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders o
             WHERE o.market_id = ?1 AND o.status IN ('open', 'partial')
             ORDER BY o.created_at ASC",
        ))
        .bind(market_id)
        .fetch_all(&self.db.pool)
        .await;

        let book = self.book(market_id);
        let mut book = book.write();
        *book = OrderBook::new(market_id);
        if let Ok(rows) = rows {
            for row in rows {
                if let Ok(order) = Order::try_from(row) {
                    if let Ok(entry) = (&order).try_into() {
                        let _ = book.add_order(entry);
                    }
                }
            }
        }
        tracing::warn!(market = market_id, "orderbook rebuilt after failed transaction");
    }

    // ========================================================================
    // Placement
    // ========================================================================

    pub async fn place_order(
        &self,
        user_id: &str,
        req: PlaceOrderRequest,
        idempotency_key: Option<String>,
    ) -> Result<PlaceResult, CoreError> {
        validate_request(&req)?;

        if let Some(key) = &idempotency_key {
            if key.is_empty() || key.len() > 128 {
                return Err(CoreError::validation(
                    "INVALID_IDEMPOTENCY_KEY",
                    "idempotency key must be 1-128 characters",
                ));
            }
            if let Some(stored) = self.check_idempotency(user_id, key).await? {
                tracing::debug!(user = user_id, key = %key, "idempotent replay served from cache");
                return Ok(stored);
            }
            self.reserve_idempotency(user_id, key).await?;
        }

        let result = self.execute_place(user_id, &req, idempotency_key.as_deref()).await;

        if let Some(key) = &idempotency_key {
            match &result {
                Ok(response) => self.store_idempotency(user_id, key, response).await?,
                Err(_) => {
                    // Failed attempts release the key for a clean retry
                    sqlx::query(
                        "DELETE FROM idempotency_cache WHERE idempotency_key = ?1 AND user_id = ?2",
                    )
                    .bind(key)
                    .bind(user_id)
                    .execute(&self.db.pool)
                    .await?;
                }
            }
        }

        result
    }

    async fn execute_place(
        &self,
        user_id: &str,
        req: &PlaceOrderRequest,
        idempotency_key: Option<&str>,
    ) -> Result<PlaceResult, CoreError> {
        let market = markets::get_market(&self.db.pool, &req.market_id)
            .await?
            .ok_or_else(|| CoreError::market_not_found(&req.market_id))?;
        if market.status != MarketStatus::Open {
            return Err(CoreError::validation(
                "MARKET_NOT_OPEN",
                format!("market {} is {}", market.id, market.status),
            ));
        }

        // Pure market orders carry no price
        let limit_price = match req.order_type {
            OrderType::Limit => req.price,
            OrderType::Market => None,
        };

        let _user_guard = self.balances.lock(user_id).await;
        let market_lock = self.market_lock(&req.market_id);
        let _market_guard = market_lock.lock().await;

        let book_arc = self.book(&req.market_id);

        // Buy locking rate: the limit price, or best ask / 1.0 ceiling for
        // market buys with no reference price.
        let lock_rate = match req.action {
            OrderAction::Buy => match limit_price {
                Some(price) => price,
                None => {
                    let ask_side = BookSide::of(req.side, OrderAction::Sell);
                    book_arc.read().best_price(ask_side).unwrap_or(Decimal::ONE)
                }
            },
            OrderAction::Sell => Decimal::ZERO,
        };
        let initial_lock = lock_rate * req.quantity;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let incoming = IncomingOrder {
            id: order_id,
            market_id: req.market_id.clone(),
            user_id: user_id.to_string(),
            side: req.side,
            action: req.action,
            order_type: req.order_type,
            price: limit_price,
            quantity: req.quantity,
            created_at: now,
        };

        let result = self
            .place_in_transaction(&incoming, req, lock_rate, initial_lock, idempotency_key, &book_arc)
            .await;

        match result {
            Ok((place_result, account_changed)) => {
                self.submit_fund_lock(user_id, order_id, req.action, place_result.locked_amount);
                self.emit_placement_events(user_id, &incoming, &place_result, account_changed);
                Ok(place_result)
            }
            Err(err) => {
                // The in-memory book may have advanced past the rolled-back
                // store state; rebuild it from durable orders.
                self.rebuild_book(&req.market_id).await;
                Err(err)
            }
        }
    }

    async fn place_in_transaction(
        &self,
        incoming: &IncomingOrder,
        req: &PlaceOrderRequest,
        lock_rate: Decimal,
        initial_lock: Decimal,
        idempotency_key: Option<&str>,
        book_arc: &Arc<RwLock<OrderBook>>,
    ) -> Result<(PlaceResult, bool), CoreError> {
        let user_id = &incoming.user_id;
        let mut tx = self.db.pool.begin().await?;

        match req.action {
            OrderAction::Buy => {
                balances::lock_funds(&mut tx, user_id, initial_lock).await?;
            }
            OrderAction::Sell => {
                positions::lock_shares(&mut tx, user_id, &req.market_id, req.side, req.quantity)
                    .await?;
            }
        }

        let outcome = {
            let mut book = book_arc.write();
            matching::match_order(&mut book, incoming)
        };

        let filled = outcome.filled_quantity;
        let remaining = req.quantity - filled;

        // Fill cost on the taker's own side; price improvement and any
        // never-resting remainder release their lock immediately.
        let locked_amount = match req.action {
            OrderAction::Buy => {
                let cost: Decimal = outcome
                    .fills
                    .iter()
                    .map(|f| f.quantity * f.taker_unit_price)
                    .sum();
                let needed = cost
                    + if outcome.rests {
                        lock_rate * remaining
                    } else {
                        Decimal::ZERO
                    };
                let release = initial_lock - needed;
                if release > Decimal::ZERO {
                    balances::unlock_funds(&mut tx, user_id, release).await?;
                }
                needed
            }
            OrderAction::Sell => {
                if !outcome.rests && remaining > Decimal::ZERO {
                    positions::unlock_shares(&mut tx, user_id, &req.market_id, req.side, remaining)
                        .await?;
                }
                Decimal::ZERO
            }
        };

        sqlx::query(
            "INSERT INTO orders (id, market_id, user_id, side, action, order_type, price,
                                 quantity, filled_quantity, status, locked_amount,
                                 idempotency_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
        )
        .bind(incoming.id.to_string())
        .bind(&incoming.market_id)
        .bind(&incoming.user_id)
        .bind(incoming.side)
        .bind(incoming.action)
        .bind(incoming.order_type)
        .bind(incoming.price.map(|p| p.to_string()))
        .bind(incoming.quantity.to_string())
        .bind(filled.to_string())
        .bind(outcome.taker_status)
        .bind(locked_amount.to_string())
        .bind(idempotency_key)
        .bind(incoming.created_at)
        .execute(&mut *tx)
        .await?;

        for trade in &outcome.trades {
            insert_trade(&mut tx, trade).await?;
        }
        for fill in &outcome.fills {
            sqlx::query(
                "UPDATE orders SET filled_quantity = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            )
            .bind(fill.filled_after.to_string())
            .bind(fill.status_after)
            .bind(Utc::now())
            .bind(fill.order_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        if !outcome.trades.is_empty() {
            markets::apply_trade_stats(&mut tx, &incoming.market_id, &outcome.trades).await?;
        }

        tx.commit().await?;

        let account_changed = req.action == OrderAction::Buy;
        Ok((
            PlaceResult {
                order_id: incoming.id,
                status: outcome.taker_status,
                filled_quantity: filled,
                remaining_quantity: remaining,
                trades: outcome.trades,
                locked_amount,
                idempotency_key: idempotency_key.map(str::to_string),
            },
            account_changed,
        ))
    }

    /// Mirror the off-chain lock onto the ledger. Best effort: settlement
    /// re-locks through the batch flow, so a miss here only widens drift
    /// until reconciliation.
    fn submit_fund_lock(
        &self,
        user_id: &str,
        order_id: Uuid,
        action: OrderAction,
        locked_amount: Decimal,
    ) {
        if action != OrderAction::Buy || locked_amount <= Decimal::ZERO {
            return;
        }
        let ledger = self.ledger.clone();
        let db = self.db.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let contract_id = {
                let mut conn = match db.pool.acquire().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                match balances::get_account(&mut conn, &user_id).await {
                    Ok(Some(account)) => account.account_contract_id,
                    _ => None,
                }
            };
            let Some(contract_id) = contract_id else {
                return;
            };
            let command = CommandRequest::exercise(
                format!("lock-{order_id}"),
                user_id.clone(),
                templates::TRADING_ACCOUNT,
                contract_id,
                "LockFunds",
                json!({ "amount": locked_amount.to_string() }),
            );
            if let Err(e) = ledger.submit_command(command).await {
                tracing::warn!(user = %user_id, order = %order_id, "LockFunds submission failed: {e}");
            }
        });
    }

    fn emit_placement_events(
        &self,
        user_id: &str,
        incoming: &IncomingOrder,
        result: &PlaceResult,
        account_changed: bool,
    ) {
        let market_id = &incoming.market_id;

        self.hub.send_to_user(
            user_id,
            "orders",
            OutboundMessage::event(
                "orders",
                "order_updated",
                json!({
                    "orderId": result.order_id,
                    "marketId": market_id,
                    "status": result.status,
                    "filledQuantity": result.filled_quantity.to_string(),
                    "remainingQuantity": result.remaining_quantity.to_string(),
                }),
            ),
        );

        let trades_channel = format!("trades:{market_id}");
        for trade in &result.trades {
            self.hub.broadcast(
                &trades_channel,
                OutboundMessage::event(
                    &trades_channel,
                    "trade",
                    serde_json::to_value(trade).unwrap_or_default(),
                ),
            );
            // Counterparty order update
            let maker_user = if trade.buyer_id == *user_id {
                &trade.seller_id
            } else {
                &trade.buyer_id
            };
            self.hub.send_to_user(
                maker_user,
                "orders",
                OutboundMessage::event(
                    "orders",
                    "order_updated",
                    json!({
                        "marketId": market_id,
                        "tradeId": trade.id,
                        "quantity": trade.quantity.to_string(),
                    }),
                ),
            );
        }

        let book_channel = format!("orderbook:{market_id}");
        let snapshot = self.orderbook_snapshot(market_id);
        self.hub.broadcast(
            &book_channel,
            OutboundMessage::event(
                &book_channel,
                "orderbook",
                serde_json::to_value(&snapshot).unwrap_or_default(),
            ),
        );

        if account_changed {
            self.emit_balance_event(user_id);
        }
    }

    fn emit_balance_event(&self, user_id: &str) {
        let db = self.db.clone();
        let hub = self.hub.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let Ok(mut conn) = db.pool.acquire().await else {
                return;
            };
            if let Ok(Some(account)) = balances::get_account(&mut conn, &user_id).await {
                hub.send_to_user(
                    &user_id,
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
            }
        });
    }

    // ========================================================================
    // Cancellation & queries
    // ========================================================================

    pub async fn cancel_order(&self, user_id: &str, order_id: Uuid) -> Result<Order, CoreError> {
        // Ownership is checked before existence is revealed
        let order = self.fetch_order(order_id).await?;
        let order = match order {
            Some(order) if order.user_id == user_id => order,
            _ => return Err(CoreError::order_not_found(order_id)),
        };

        if !order.status.is_resting() {
            return Err(CoreError::conflict(
                "ORDER_NOT_CANCELLABLE",
                format!("order {order_id} is {}", order.status),
            ));
        }

        let _user_guard = self.balances.lock(user_id).await;
        let market_lock = self.market_lock(&order.market_id);
        let _market_guard = market_lock.lock().await;

        let book_arc = self.book(&order.market_id);
        let result: Result<Order, CoreError> = async {
            let mut tx = self.db.pool.begin().await?;

            // Re-read under the market lock; a concurrent fill may have
            // completed the order.
            let current = fetch_order_with(&mut tx, order_id)
                .await?
                .ok_or_else(|| CoreError::order_not_found(order_id))?;
            if !current.status.is_resting() {
                return Err(CoreError::conflict(
                    "ORDER_NOT_CANCELLABLE",
                    format!("order {order_id} is {}", current.status),
                ));
            }

            let remaining = current.remaining();
            let mut released = Decimal::ZERO;
            match current.action {
                OrderAction::Buy => {
                    if let Some(price) = current.price {
                        released = price * remaining;
                        if released > Decimal::ZERO {
                            balances::unlock_funds(&mut tx, user_id, released).await?;
                        }
                    }
                }
                OrderAction::Sell => {
                    positions::unlock_shares(
                        &mut tx,
                        user_id,
                        &current.market_id,
                        current.side,
                        remaining,
                    )
                    .await?;
                }
            }

            let locked_remaining = (current.locked_amount - released).max(Decimal::ZERO);
            sqlx::query(
                "UPDATE orders SET status = 'cancelled', locked_amount = ?1, updated_at = ?2
                 WHERE id = ?3",
            )
            .bind(locked_remaining.to_string())
            .bind(Utc::now())
            .bind(order_id.to_string())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            book_arc.write().remove_order(order_id);

            self.fetch_order(order_id)
                .await?
                .ok_or_else(|| CoreError::order_not_found(order_id))
        }
        .await;

        match result {
            Ok(cancelled) => {
                self.hub.send_to_user(
                    user_id,
                    "orders",
                    OutboundMessage::event(
                        "orders",
                        "order_cancelled",
                        json!({
                            "orderId": order_id,
                            "marketId": cancelled.market_id,
                            "status": cancelled.status,
                        }),
                    ),
                );
                if cancelled.action == OrderAction::Buy {
                    self.emit_balance_event(user_id);
                }
                let channel = format!("orderbook:{}", cancelled.market_id);
                let snapshot = self.orderbook_snapshot(&cancelled.market_id);
                self.hub.broadcast(
                    &channel,
                    OutboundMessage::event(
                        &channel,
                        "orderbook",
                        serde_json::to_value(&snapshot).unwrap_or_default(),
                    ),
                );
                Ok(cancelled)
            }
            Err(err) => {
                self.rebuild_book(&order.market_id).await;
                Err(err)
            }
        }
    }

    pub async fn get_order(&self, user_id: &str, order_id: Uuid) -> Result<Order, CoreError> {
        match self.fetch_order(order_id).await? {
            Some(order) if order.user_id == user_id => Ok(order),
            _ => Err(CoreError::order_not_found(order_id)),
        }
    }

    pub async fn list_orders(
        &self,
        user_id: &str,
        filters: OrderFilters,
    ) -> Result<Vec<Order>, CoreError> {
        let mut sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders o WHERE o.user_id = ?1"
        );
        if filters.market_id.is_some() {
            sql.push_str(" AND o.market_id = ?2");
        }
        if filters.status.is_some() {
            sql.push_str(" AND o.status = ?3");
        }
        sql.push_str(" ORDER BY o.created_at DESC LIMIT ?4");

        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(filters.market_id.clone().unwrap_or_default())
            .bind(filters.status.unwrap_or(OrderStatus::Open))
            .bind(filters.get_limit() as i64)
            .fetch_all(&self.db.pool)
            .await?;
        rows.into_iter().map(Order::try_from).collect()
    }

    async fn fetch_order(&self, order_id: Uuid) -> Result<Option<Order>, CoreError> {
        let row: Option<OrderRow> =
            sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders o WHERE o.id = ?1"))
                .bind(order_id.to_string())
                .fetch_optional(&self.db.pool)
                .await?;
        row.map(Order::try_from).transpose()
    }

    // ========================================================================
    // Idempotency cache
    // ========================================================================

    async fn check_idempotency(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<PlaceResult>, CoreError> {
        let row: Option<(Option<String>, chrono::DateTime<Utc>)> = sqlx::query_as(
            "SELECT response, expires_at FROM idempotency_cache
             WHERE idempotency_key = ?1 AND user_id = ?2",
        )
        .bind(key)
        .bind(user_id)
        .fetch_optional(&self.db.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((_, expires_at)) if expires_at <= Utc::now() => {
                sqlx::query(
                    "DELETE FROM idempotency_cache WHERE idempotency_key = ?1 AND user_id = ?2",
                )
                .bind(key)
                .bind(user_id)
                .execute(&self.db.pool)
                .await?;
                Ok(None)
            }
            Some((Some(response), _)) => {
                let stored: PlaceResult = serde_json::from_str(&response)
                    .map_err(|e| CoreError::Internal(format!("corrupt idempotency cache: {e}")))?;
                Ok(Some(stored))
            }
            Some((None, _)) => Err(CoreError::conflict(
                "IDEMPOTENCY_IN_FLIGHT",
                "a request with this idempotency key is still executing",
            )),
        }
    }

    async fn reserve_idempotency(&self, user_id: &str, key: &str) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO idempotency_cache (idempotency_key, user_id, response, expires_at)
             VALUES (?1, ?2, NULL, ?3)",
        )
        .bind(key)
        .bind(user_id)
        .bind(Utc::now() + chrono::Duration::hours(IDEMPOTENCY_TTL_HOURS))
        .execute(&self.db.pool)
        .await
        .map_err(|_| {
            CoreError::conflict(
                "IDEMPOTENCY_IN_FLIGHT",
                "a request with this idempotency key is still executing",
            )
        })?;
        Ok(())
    }

    async fn store_idempotency(
        &self,
        user_id: &str,
        key: &str,
        response: &PlaceResult,
    ) -> Result<(), CoreError> {
        let body = serde_json::to_string(response)
            .map_err(|e| CoreError::Internal(format!("serialize place result: {e}")))?;
        sqlx::query(
            "UPDATE idempotency_cache SET response = ?1
             WHERE idempotency_key = ?2 AND user_id = ?3",
        )
        .bind(body)
        .bind(key)
        .bind(user_id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}

fn validate_request(req: &PlaceOrderRequest) -> Result<(), CoreError> {
    if req.quantity <= Decimal::ZERO {
        return Err(CoreError::validation(
            "INVALID_QUANTITY",
            "quantity must be positive",
        ));
    }
    if req.quantity > max_order_quantity() {
        return Err(CoreError::validation(
            "QUANTITY_TOO_LARGE",
            format!("quantity exceeds {}", max_order_quantity()),
        ));
    }
    if req.order_type == OrderType::Limit {
        let price = req.price.ok_or_else(|| {
            CoreError::validation("INVALID_PRICE", "limit orders require a price")
        })?;
        if price < min_price() || price > max_price() {
            return Err(CoreError::validation(
                "INVALID_PRICE",
                format!("price must be within [{}, {}]", min_price(), max_price()),
            ));
        }
    }
    Ok(())
}

async fn fetch_order_with(
    conn: &mut SqliteConnection,
    order_id: Uuid,
) -> Result<Option<Order>, CoreError> {
    let row: Option<OrderRow> =
        sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders o WHERE o.id = ?1"))
            .bind(order_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    row.map(Order::try_from).transpose()
}

async fn insert_trade(conn: &mut SqliteConnection, trade: &Trade) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO trades (id, market_id, buyer_id, seller_id, side, price, quantity,
                             buyer_order_id, seller_order_id, trade_type, settlement_status,
                             created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )
    .bind(trade.id.to_string())
    .bind(&trade.market_id)
    .bind(&trade.buyer_id)
    .bind(&trade.seller_id)
    .bind(trade.side)
    .bind(trade.price.to_string())
    .bind(trade.quantity.to_string())
    .bind(trade.buyer_order_id.to_string())
    .bind(trade.seller_order_id.to_string())
    .bind(trade.trade_type)
    .bind(trade.settlement_status)
    .bind(trade.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
