//! Balance Reconciliation
//!
//! Periodic control loop: for accounts whose projection has gone stale,
//! fetch the canonical TradingAccount from the ledger and compare. The
//! chain is authoritative; drift beyond tolerance overwrites the
//! projection. Every check appends a history row, reconciled or not.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::config::ReconciliationConfig;
use crate::db::Database;
use crate::errors::CoreError;
use crate::ledger::templates::{self, TradingAccountPayload};
use crate::ledger::{ContractFilter, LedgerClient};
use crate::models::Account;
use crate::services::balances::BalanceRegistry;
use crate::services::projections;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReconciliationSummary {
    pub checked: u64,
    pub reconciled: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconciliationStatus {
    pub is_running: bool,
    pub runs: u64,
    pub accounts_reconciled: u64,
    pub errors: u64,
}

pub struct ReconciliationService {
    db: Database,
    ledger: Arc<dyn LedgerClient>,
    balances: Arc<BalanceRegistry>,
    config: ReconciliationConfig,
    running: AtomicBool,
    runs: AtomicU64,
    accounts_reconciled: AtomicU64,
    errors: AtomicU64,
}

impl ReconciliationService {
    pub fn new(
        db: Database,
        ledger: Arc<dyn LedgerClient>,
        balances: Arc<BalanceRegistry>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            balances,
            config,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            accounts_reconciled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> ReconciliationStatus {
        ReconciliationStatus {
            is_running: self.running.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            accounts_reconciled: self.accounts_reconciled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn start(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.running.store(true, Ordering::Relaxed);
            let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_ms = self.config.interval_ms, "reconciliation started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(summary) => {
                                self.runs.fetch_add(1, Ordering::Relaxed);
                                if summary.reconciled > 0 {
                                    tracing::info!(?summary, "reconciliation corrected drift");
                                }
                            }
                            Err(e) => {
                                self.errors.fetch_add(1, Ordering::Relaxed);
                                tracing::error!("reconciliation run failed: {e}");
                            }
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            self.running.store(false, Ordering::Relaxed);
            tracing::info!("reconciliation stopped");
        })
    }

    /// One sweep over stale accounts. Public for deterministic tests.
    pub async fn run_once(&self) -> Result<ReconciliationSummary, CoreError> {
        let stale =
            projections::stale_accounts(&self.db.pool, self.config.stale_threshold_minutes).await?;
        let mut summary = ReconciliationSummary::default();

        for account in stale {
            summary.checked += 1;
            match self.reconcile_account(&account).await {
                Ok(true) => {
                    summary.reconciled += 1;
                    self.accounts_reconciled.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(e) => {
                    // Per-account failures never stop the sweep
                    summary.errors += 1;
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(user = %account.user_id, "reconcile failed: {e}");
                }
            }
        }
        Ok(summary)
    }

    async fn reconcile_account(&self, account: &Account) -> Result<bool, CoreError> {
        let contracts = self
            .ledger
            .get_active_contracts(ContractFilter {
                template_id: Some(templates::TRADING_ACCOUNT.to_string()),
                party: Some(account.party_id.clone()),
            })
            .await?;
        let Some(contract) = contracts.first() else {
            tracing::warn!(user = %account.user_id, "no active TradingAccount on ledger");
            return Ok(false);
        };
        let onchain: TradingAccountPayload =
            templates::decode_payload(&contract.template_id, &contract.payload)?;

        let drift = (account.available_balance - onchain.available_balance).abs()
            + (account.locked_balance - onchain.locked_balance).abs();
        // The floor makes zero-balance accounts divide safely
        let denominator = (onchain.available_balance + onchain.locked_balance).max(Decimal::ONE);
        let relative = drift / denominator;
        let reconcile = relative > self.config.drift_tolerance;

        let _guard = self.balances.lock(&account.user_id).await;
        let mut tx = self.db.pool.begin().await?;

        if reconcile {
            sqlx::query(
                "UPDATE accounts SET available_balance = ?1, locked_balance = ?2,
                        account_contract_id = ?3, last_updated = ?4
                 WHERE user_id = ?5",
            )
            .bind(onchain.available_balance.to_string())
            .bind(onchain.locked_balance.to_string())
            .bind(&contract.contract_id)
            .bind(Utc::now())
            .bind(&account.user_id)
            .execute(&mut *tx)
            .await?;
            tracing::warn!(
                user = %account.user_id,
                %drift,
                %relative,
                "projection overwritten from chain"
            );
        } else {
            // Freshen the timestamp so the account leaves the stale set
            sqlx::query("UPDATE accounts SET last_updated = ?1 WHERE user_id = ?2")
                .bind(Utc::now())
                .bind(&account.user_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO reconciliation_history
                 (user_id, previous_available, previous_locked, onchain_available,
                  onchain_locked, drift, relative_drift, reconciled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&account.user_id)
        .bind(account.available_balance.to_string())
        .bind(account.locked_balance.to_string())
        .bind(onchain.available_balance.to_string())
        .bind(onchain.locked_balance.to_string())
        .bind(drift.to_string())
        .bind(relative.to_string())
        .bind(reconcile)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reconcile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::MockLedger;
    use crate::services::balances;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn seed_stale_account(db: &Database, user: &str, available: &str, locked: &str) {
        sqlx::query(
            "INSERT INTO accounts (user_id, party_id, available_balance, locked_balance, last_updated)
             VALUES (?1, ?1, ?2, ?3, ?4)",
        )
        .bind(user)
        .bind(available)
        .bind(locked)
        .bind(Utc::now() - chrono::Duration::minutes(30))
        .execute(&db.pool)
        .await
        .unwrap();
    }

    fn onchain_contract(owner: &str, available: &str, locked: &str) -> crate::ledger::Contract {
        MockLedger::contract(
            "acct-1",
            templates::TRADING_ACCOUNT,
            json!({
                "owner": owner,
                "availableBalance": available,
                "lockedBalance": locked,
            }),
            vec![owner.to_string()],
        )
    }

    fn service(db: Database, ledger: Arc<MockLedger>) -> ReconciliationService {
        ReconciliationService::new(
            db,
            ledger,
            Arc::new(BalanceRegistry::new()),
            ReconciliationConfig {
                interval_ms: 10,
                stale_threshold_minutes: 5,
                drift_tolerance: Decimal::new(1, 3),
            },
        )
    }

    #[tokio::test]
    async fn test_drift_beyond_tolerance_overwrites_projection() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = Arc::new(MockLedger::new());
        seed_stale_account(&db, "alice", "80", "0").await;
        ledger.set_contracts(vec![onchain_contract("alice", "100", "5")]);

        let summary = service(db.clone(), ledger).run_once().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.reconciled, 1);

        // Projection now equals the chain
        let mut conn = db.pool.acquire().await.unwrap();
        let account = balances::get_account(&mut conn, "alice").await.unwrap().unwrap();
        assert_eq!(account.available_balance, dec!(100));
        assert_eq!(account.locked_balance, dec!(5));
        drop(conn);

        let (reconciled,): (bool,) =
            sqlx::query_as("SELECT reconciled FROM reconciliation_history WHERE user_id = 'alice'")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert!(reconciled);
    }

    #[tokio::test]
    async fn test_drift_within_tolerance_keeps_projection() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = Arc::new(MockLedger::new());
        // 0.005 absolute drift on a 100 base: relative 0.00005, tolerated
        seed_stale_account(&db, "alice", "99.995", "0").await;
        ledger.set_contracts(vec![onchain_contract("alice", "100", "0")]);

        let summary = service(db.clone(), ledger).run_once().await.unwrap();
        assert_eq!(summary.reconciled, 0);

        let mut conn = db.pool.acquire().await.unwrap();
        let account = balances::get_account(&mut conn, "alice").await.unwrap().unwrap();
        assert_eq!(account.available_balance, dec!(99.995));
        drop(conn);

        // History row written either way
        let (reconciled,): (bool,) =
            sqlx::query_as("SELECT reconciled FROM reconciliation_history WHERE user_id = 'alice'")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert!(!reconciled);
    }

    #[tokio::test]
    async fn test_zero_balance_account_divides_safely() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = Arc::new(MockLedger::new());
        seed_stale_account(&db, "alice", "3", "0").await;
        ledger.set_contracts(vec![onchain_contract("alice", "0", "0")]);

        // drift 3 over max(0,1) = 3 > tolerance: reconciled without panic
        let summary = service(db.clone(), ledger).run_once().await.unwrap();
        assert_eq!(summary.reconciled, 1);
    }

    #[tokio::test]
    async fn test_fresh_accounts_skipped() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = Arc::new(MockLedger::new());
        sqlx::query(
            "INSERT INTO accounts (user_id, party_id, available_balance, locked_balance, last_updated)
             VALUES ('alice', 'alice', '80', '0', ?1)",
        )
        .bind(Utc::now())
        .execute(&db.pool)
        .await
        .unwrap();
        ledger.set_contracts(vec![onchain_contract("alice", "100", "0")]);

        let summary = service(db, ledger).run_once().await.unwrap();
        assert_eq!(summary.checked, 0);
    }

    #[tokio::test]
    async fn test_missing_onchain_account_is_skipped_not_fatal() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = Arc::new(MockLedger::new());
        seed_stale_account(&db, "alice", "80", "0").await;

        let summary = service(db, ledger).run_once().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.reconciled, 0);
        assert_eq!(summary.errors, 0);
    }
}
