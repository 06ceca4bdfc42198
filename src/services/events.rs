//! Ledger Event Processor
//!
//! Streams transactions from the ledger and folds them into the local
//! projections. Each ledger transaction is applied in one store
//! transaction together with the offset checkpoint, so a crash replays
//! from the last committed offset (at-least-once, idempotent writes).
//! Connection loss reconnects with capped exponential backoff.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::watch;

use crate::config::EventProcessorConfig;
use crate::db::Database;
use crate::errors::CoreError;
use crate::ledger::templates::{
    self, MarketPayload, MarketSettlementPayload, PositionPayload, TradingAccountPayload,
};
use crate::ledger::{EventKind, LedgerClient, LedgerEvent, TransactionEvent, TransactionFilter};
use crate::services::projections;
use crate::ws::messages::OutboundMessage;
use crate::ws::SubscriptionHub;

const OFFSET_KEY: &str = "last_processed_offset";

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessorStatus {
    pub is_running: bool,
    pub current_offset: i64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub events_processed: u64,
    pub errors: u64,
}

pub struct EventProcessor {
    db: Database,
    ledger: Arc<dyn LedgerClient>,
    hub: Arc<SubscriptionHub>,
    config: EventProcessorConfig,
    running: AtomicBool,
    current_offset: AtomicI64,
    reconnect_attempts: AtomicU32,
    events_processed: AtomicU64,
    errors: AtomicU64,
    last_event_time: RwLock<Option<DateTime<Utc>>>,
}

impl EventProcessor {
    pub fn new(
        db: Database,
        ledger: Arc<dyn LedgerClient>,
        hub: Arc<SubscriptionHub>,
        config: EventProcessorConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            hub,
            config,
            running: AtomicBool::new(false),
            current_offset: AtomicI64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            events_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_event_time: RwLock::new(None),
        }
    }

    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            is_running: self.running.load(Ordering::Relaxed),
            current_offset: self.current_offset.load(Ordering::Relaxed),
            last_event_time: *self.last_event_time.read(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub async fn last_processed_offset(&self) -> Result<i64, CoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM system_state WHERE key = ?1")
                .bind(OFFSET_KEY)
                .fetch_optional(&self.db.pool)
                .await?;
        Ok(row.and_then(|(v,)| v.parse().ok()).unwrap_or(0))
    }

    /// Backoff for the nth consecutive failed connect (0-based), capped.
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_reconnect_ms as f64;
        let factor = self.config.reconnect_multiplier.powi(attempt as i32);
        let ms = (base * factor).min(self.config.max_reconnect_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn start(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.running.store(true, Ordering::Relaxed);
            tracing::info!("event processor started");
            let mut consecutive_failures: u32 = 0;

            'outer: loop {
                if *stop.borrow() {
                    break;
                }

                let begin_offset = match self.last_processed_offset().await {
                    Ok(offset) => offset,
                    Err(e) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::error!("failed to read last offset: {e}");
                        0
                    }
                };
                self.current_offset.store(begin_offset, Ordering::Relaxed);

                let filter = TransactionFilter {
                    begin_offset,
                    template_ids: vec![
                        templates::TRADING_ACCOUNT.to_string(),
                        templates::POSITION.to_string(),
                        templates::MARKET.to_string(),
                        templates::MARKET_SETTLEMENT.to_string(),
                        templates::SETTLEMENT.to_string(),
                        templates::SETTLEMENT_PROPOSAL.to_string(),
                    ],
                    parties: None,
                };

                match self.ledger.stream_transactions(filter).await {
                    Ok(mut stream) => {
                        loop {
                            tokio::select! {
                                item = stream.next() => match item {
                                    Some(Ok(tx_event)) => {
                                        match self.apply_transaction(&tx_event).await {
                                            Ok(_) => {
                                                // First success resets the backoff
                                                consecutive_failures = 0;
                                            }
                                            Err(e) => {
                                                self.errors.fetch_add(1, Ordering::Relaxed);
                                                tracing::error!(
                                                    offset = tx_event.offset,
                                                    "projection update failed, offset not advanced: {e}"
                                                );
                                                break;
                                            }
                                        }
                                    }
                                    Some(Err(e)) => {
                                        self.errors.fetch_add(1, Ordering::Relaxed);
                                        tracing::warn!("transaction stream error: {e}");
                                        break;
                                    }
                                    None => {
                                        tracing::debug!("transaction stream closed");
                                        break;
                                    }
                                },
                                _ = stop.changed() => break 'outer,
                            }
                        }
                    }
                    Err(e) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("stream connect failed: {e}");
                    }
                }

                // Reconnect with capped exponential backoff
                let delay = self.reconnect_delay(consecutive_failures);
                consecutive_failures = consecutive_failures.saturating_add(1);
                self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => break,
                }
            }

            self.running.store(false, Ordering::Relaxed);
            tracing::info!("event processor stopped");
        })
    }

    /// Apply one ledger transaction atomically: projection writes plus the
    /// offset advance commit together. Replays of already-seen offsets are
    /// skipped.
    pub async fn apply_transaction(&self, tx_event: &TransactionEvent) -> Result<bool, CoreError> {
        let last = self.last_processed_offset().await?;
        if tx_event.offset <= last {
            tracing::debug!(offset = tx_event.offset, "skipping already-processed transaction");
            return Ok(false);
        }

        let mut tx = self.db.pool.begin().await?;
        let mut touched_users = Vec::new();
        for event in &tx_event.events {
            if let Some(user) = self.route_event(&mut tx, event).await? {
                touched_users.push(user);
            }
        }
        sqlx::query(
            "INSERT INTO system_state (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = ?2",
        )
        .bind(OFFSET_KEY)
        .bind(tx_event.offset.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.current_offset.store(tx_event.offset, Ordering::Relaxed);
        self.events_processed
            .fetch_add(tx_event.events.len() as u64, Ordering::Relaxed);
        *self.last_event_time.write() = Some(Utc::now());

        touched_users.sort();
        touched_users.dedup();
        for user in touched_users {
            self.hub.send_to_user(
                &user,
                "balance",
                OutboundMessage::event("balance", "projection_updated", json!({ "userId": user })),
            );
            self.hub.send_to_user(
                &user,
                "positions",
                OutboundMessage::event("positions", "projection_updated", json!({ "userId": user })),
            );
        }
        Ok(true)
    }

    /// Dispatch one event by template name. Returns the affected user for
    /// hub notification, if any.
    async fn route_event(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        event: &LedgerEvent,
    ) -> Result<Option<String>, CoreError> {
        let name = templates::template_name(&event.template_id);
        match (name, event.kind) {
            ("TradingAccount", EventKind::Created) => {
                let payload = event.payload.as_ref().ok_or_else(|| {
                    CoreError::Internal("TradingAccount created without payload".into())
                })?;
                let decoded: TradingAccountPayload =
                    templates::decode_payload(&event.template_id, payload)?;
                projections::upsert_account(tx, &event.contract_id, &decoded).await?;
                Ok(Some(decoded.owner))
            }
            ("Position", EventKind::Created) => {
                let payload = event.payload.as_ref().ok_or_else(|| {
                    CoreError::Internal("Position created without payload".into())
                })?;
                let decoded: PositionPayload =
                    templates::decode_payload(&event.template_id, payload)?;
                projections::upsert_position(tx, &event.contract_id, &decoded).await?;
                Ok(Some(decoded.owner))
            }
            ("Position", EventKind::Archived) => {
                projections::archive_position(tx, &event.contract_id).await?;
                Ok(None)
            }
            ("Market", EventKind::Created) => {
                let payload = event.payload.as_ref().ok_or_else(|| {
                    CoreError::Internal("Market created without payload".into())
                })?;
                let decoded: MarketPayload =
                    templates::decode_payload(&event.template_id, payload)?;
                projections::upsert_market(tx, &event.contract_id, &decoded).await?;
                Ok(None)
            }
            ("MarketSettlement", EventKind::Created) => {
                let payload = event.payload.as_ref().ok_or_else(|| {
                    CoreError::Internal("MarketSettlement created without payload".into())
                })?;
                let decoded: MarketSettlementPayload =
                    templates::decode_payload(&event.template_id, payload)?;
                projections::resolve_market(tx, &decoded).await?;
                Ok(None)
            }
            (
                "Settlement" | "SettlementProposal" | "SettlementProposalAccepted"
                | "PebbleAuthorization" | "TradingAccountRequest" | "PositionMerge",
                _,
            ) => {
                // Audit only
                tracing::debug!(template = name, contract = %event.contract_id, "audit event");
                Ok(None)
            }
            _ => {
                tracing::warn!(template = %event.template_id, "unrouted ledger event");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventProcessorConfig;
    use crate::ledger::testing::MockLedger;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn processor(db: Database, ledger: Arc<MockLedger>) -> Arc<EventProcessor> {
        Arc::new(EventProcessor::new(
            db,
            ledger,
            Arc::new(SubscriptionHub::new()),
            EventProcessorConfig {
                initial_reconnect_ms: 1,
                max_reconnect_ms: 8,
                reconnect_multiplier: 2.0,
            },
        ))
    }

    fn account_tx(offset: i64, owner: &str, available: &str) -> TransactionEvent {
        TransactionEvent {
            transaction_id: format!("tx-{offset}"),
            offset,
            events: vec![LedgerEvent {
                kind: EventKind::Created,
                contract_id: format!("acct-{offset}"),
                template_id: templates::TRADING_ACCOUNT.to_string(),
                payload: Some(json!({
                    "owner": owner,
                    "availableBalance": available,
                    "lockedBalance": "0",
                })),
                stakeholders: vec![owner.to_string()],
            }],
        }
    }

    #[tokio::test]
    async fn test_apply_advances_offset_with_projection() {
        let db = Database::connect_in_memory().await.unwrap();
        let processor = processor(db.clone(), Arc::new(MockLedger::new()));

        assert!(processor.apply_transaction(&account_tx(5, "alice", "42")).await.unwrap());
        assert_eq!(processor.last_processed_offset().await.unwrap(), 5);

        let mut conn = db.pool.acquire().await.unwrap();
        let account = crate::services::balances::get_account(&mut conn, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.available_balance, dec!(42));
    }

    #[tokio::test]
    async fn test_offset_monotonic_replay_skipped() {
        let db = Database::connect_in_memory().await.unwrap();
        let processor = processor(db.clone(), Arc::new(MockLedger::new()));

        assert!(processor.apply_transaction(&account_tx(5, "alice", "42")).await.unwrap());
        // Replaying the same offset (or older) is a no-op
        assert!(!processor.apply_transaction(&account_tx(5, "alice", "99")).await.unwrap());
        assert!(!processor.apply_transaction(&account_tx(3, "alice", "99")).await.unwrap());

        assert_eq!(processor.last_processed_offset().await.unwrap(), 5);
        let mut conn = db.pool.acquire().await.unwrap();
        let account = crate::services::balances::get_account(&mut conn, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.available_balance, dec!(42));
    }

    #[tokio::test]
    async fn test_malformed_payload_rolls_back_offset() {
        let db = Database::connect_in_memory().await.unwrap();
        let processor = processor(db.clone(), Arc::new(MockLedger::new()));

        let bad = TransactionEvent {
            transaction_id: "tx-7".to_string(),
            offset: 7,
            events: vec![LedgerEvent {
                kind: EventKind::Created,
                contract_id: "acct-7".to_string(),
                template_id: templates::TRADING_ACCOUNT.to_string(),
                payload: Some(json!({ "owner": "alice" })),
                stakeholders: vec![],
            }],
        };
        assert!(processor.apply_transaction(&bad).await.is_err());
        // Offset untouched
        assert_eq!(processor.last_processed_offset().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backoff_progression_caps() {
        let db = Database::connect_in_memory().await.unwrap();
        let processor = processor(db, Arc::new(MockLedger::new()));

        assert_eq!(processor.reconnect_delay(0), Duration::from_millis(1));
        assert_eq!(processor.reconnect_delay(1), Duration::from_millis(2));
        assert_eq!(processor.reconnect_delay(2), Duration::from_millis(4));
        assert_eq!(processor.reconnect_delay(3), Duration::from_millis(8));
        // Capped at max_reconnect_ms
        assert_eq!(processor.reconnect_delay(10), Duration::from_millis(8));
    }

    #[tokio::test]
    async fn test_worker_consumes_stream_and_resumes_across_reconnects() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = Arc::new(MockLedger::new());
        // Two connection-bound batches; the worker must reconnect between them
        ledger.push_transaction_batch(vec![account_tx(1, "alice", "10")]);
        ledger.push_transaction_batch(vec![account_tx(2, "alice", "20")]);

        let processor = processor(db.clone(), ledger);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = processor.clone().start(stop_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(processor.last_processed_offset().await.unwrap(), 2);
        let status = processor.status();
        assert!(!status.is_running);
        assert_eq!(status.events_processed, 2);
        assert!(status.reconnect_attempts >= 1);

        let mut conn = db.pool.acquire().await.unwrap();
        let account = crate::services::balances::get_account(&mut conn, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.available_balance, dec!(20));
    }
}
