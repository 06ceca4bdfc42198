//! Account Service
//!
//! Onboarding, deposits, withdrawals, and the dev faucet history. The
//! ledger moves first on deposits and withdrawals; the projection follows
//! only after the command is accepted, so a ledger failure leaves
//! off-chain state untouched.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::db::Database;
use crate::errors::CoreError;
use crate::ledger::{templates, CommandRequest, LedgerClient};
use crate::models::account::BalanceResponse;
use crate::services::balances::{self, BalanceRegistry};
use crate::ws::messages::OutboundMessage;
use crate::ws::SubscriptionHub;

const FAUCET_DAILY_LIMIT: i64 = 5;

pub struct AccountService {
    db: Database,
    ledger: Arc<dyn LedgerClient>,
    hub: Arc<SubscriptionHub>,
    balances: Arc<BalanceRegistry>,
    admin_party: String,
}

impl AccountService {
    pub fn new(
        db: Database,
        ledger: Arc<dyn LedgerClient>,
        hub: Arc<SubscriptionHub>,
        balances: Arc<BalanceRegistry>,
        admin_party: String,
    ) -> Self {
        Self {
            db,
            ledger,
            hub,
            balances,
            admin_party,
        }
    }

    /// Provision a trading account: allocate the party, run the
    /// request/accept handshake, record the projection row. `userId`
    /// equals `partyId` in the MVP.
    pub async fn open_account(&self, user_id: &str) -> Result<BalanceResponse, CoreError> {
        if user_id.trim().is_empty() {
            return Err(CoreError::validation("INVALID_USER_ID", "user id is empty"));
        }

        {
            let mut conn = self.db.pool.acquire().await?;
            if balances::get_account(&mut conn, user_id).await?.is_some() {
                return Err(CoreError::conflict(
                    "ACCOUNT_EXISTS",
                    format!("account {user_id} already exists"),
                ));
            }
        }

        let party = self.ledger.allocate_party(user_id, Some(user_id)).await?;
        self.ledger
            .grant_party_rights(&party.party, Some(user_id))
            .await?;

        let request = self
            .ledger
            .submit_command(CommandRequest::create(
                format!("account-request-{user_id}"),
                party.party.clone(),
                templates::TRADING_ACCOUNT_REQUEST,
                json!({ "owner": party.party, "operator": self.admin_party }),
            ))
            .await?;
        let accepted = self
            .ledger
            .submit_command(CommandRequest::exercise(
                format!("account-accept-{user_id}"),
                self.admin_party.clone(),
                templates::TRADING_ACCOUNT_REQUEST,
                request.contract_id.clone().unwrap_or_default(),
                "AcceptAccountRequest",
                json!({}),
            ))
            .await?;

        sqlx::query(
            "INSERT INTO accounts (user_id, party_id, account_contract_id, available_balance,
                                   locked_balance, last_updated)
             VALUES (?1, ?2, ?3, '0', '0', ?4)",
        )
        .bind(user_id)
        .bind(&party.party)
        .bind(&accepted.contract_id)
        .bind(Utc::now())
        .execute(&self.db.pool)
        .await?;

        tracing::info!(user = user_id, party = %party.party, "account opened");
        self.get_balance(user_id).await
    }

    pub async fn deposit(&self, user_id: &str, amount: Decimal) -> Result<BalanceResponse, CoreError> {
        if amount <= Decimal::ZERO {
            return Err(CoreError::validation(
                "INVALID_AMOUNT",
                "deposit amount must be positive",
            ));
        }

        let _guard = self.balances.lock(user_id).await;
        let contract_id = self.account_contract(user_id).await?;

        // Chain first; a refused or lost command leaves the projection alone
        self.ledger
            .submit_command(CommandRequest::exercise(
                format!("deposit-{}", Uuid::new_v4()),
                user_id.to_string(),
                templates::TRADING_ACCOUNT,
                contract_id,
                "CreditFromDeposit",
                json!({ "amount": amount.to_string() }),
            ))
            .await?;

        let mut tx = self.db.pool.begin().await?;
        balances::adjust_balance(&mut tx, user_id, amount, Decimal::ZERO).await?;
        tx.commit().await?;

        self.emit_balance(user_id).await;
        tracing::info!(user = user_id, %amount, "deposit credited");
        self.get_balance(user_id).await
    }

    pub async fn withdraw(&self, user_id: &str, amount: Decimal) -> Result<BalanceResponse, CoreError> {
        if amount <= Decimal::ZERO {
            return Err(CoreError::validation(
                "INVALID_AMOUNT",
                "withdrawal amount must be positive",
            ));
        }

        let _guard = self.balances.lock(user_id).await;
        let contract_id = self.account_contract(user_id).await?;

        {
            let mut conn = self.db.pool.acquire().await?;
            let account = balances::get_account(&mut conn, user_id)
                .await?
                .ok_or_else(|| CoreError::account_not_found(user_id))?;
            if account.available_balance < amount {
                return Err(CoreError::InsufficientFunds {
                    required: amount.to_string(),
                    available: account.available_balance.to_string(),
                });
            }
        }

        self.ledger
            .submit_command(CommandRequest::exercise(
                format!("withdraw-{}", Uuid::new_v4()),
                user_id.to_string(),
                templates::TRADING_ACCOUNT,
                contract_id,
                "WithdrawFunds",
                json!({ "amount": amount.to_string() }),
            ))
            .await?;

        let mut tx = self.db.pool.begin().await?;
        balances::adjust_balance(&mut tx, user_id, -amount, Decimal::ZERO).await?;
        tx.commit().await?;

        self.emit_balance(user_id).await;
        tracing::info!(user = user_id, %amount, "withdrawal debited");
        self.get_balance(user_id).await
    }

    /// Dev faucet: a capped number of grants per user per day, recorded
    /// for audit.
    pub async fn faucet(&self, user_id: &str, amount: Decimal) -> Result<BalanceResponse, CoreError> {
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let (recent,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM faucet_requests WHERE user_id = ?1 AND created_at > ?2",
        )
        .bind(user_id)
        .bind(cutoff)
        .fetch_one(&self.db.pool)
        .await?;
        if recent >= FAUCET_DAILY_LIMIT {
            return Err(CoreError::RateLimited);
        }

        let response = self.deposit(user_id, amount).await?;
        sqlx::query("INSERT INTO faucet_requests (user_id, amount, created_at) VALUES (?1, ?2, ?3)")
            .bind(user_id)
            .bind(amount.to_string())
            .bind(Utc::now())
            .execute(&self.db.pool)
            .await?;
        Ok(response)
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<BalanceResponse, CoreError> {
        let mut conn = self.db.pool.acquire().await?;
        let account = balances::get_account(&mut conn, user_id)
            .await?
            .ok_or_else(|| CoreError::account_not_found(user_id))?;
        Ok(account.into())
    }

    async fn account_contract(&self, user_id: &str) -> Result<String, CoreError> {
        let mut conn = self.db.pool.acquire().await?;
        let account = balances::get_account(&mut conn, user_id)
            .await?
            .ok_or_else(|| CoreError::account_not_found(user_id))?;
        Ok(account.account_contract_id.unwrap_or_default())
    }

    async fn emit_balance(&self, user_id: &str) {
        if let Ok(balance) = self.get_balance(user_id).await {
            self.hub.send_to_user(
                user_id,
                "balance",
                OutboundMessage::event(
                    "balance",
                    "balance_updated",
                    serde_json::to_value(&balance).unwrap_or_default(),
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::MockLedger;
    use rust_decimal_macros::dec;

    struct Harness {
        ledger: Arc<MockLedger>,
        service: AccountService,
    }

    async fn setup() -> Harness {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = Arc::new(MockLedger::new());
        let service = AccountService::new(
            db,
            ledger.clone(),
            Arc::new(SubscriptionHub::new()),
            Arc::new(BalanceRegistry::new()),
            "admin".to_string(),
        );
        Harness { ledger, service }
    }

    #[tokio::test]
    async fn test_open_deposit_withdraw_round_trip() {
        let h = setup().await;

        let balance = h.service.open_account("alice").await.unwrap();
        assert_eq!(balance.total, dec!(0));

        let balance = h.service.deposit("alice", dec!(100)).await.unwrap();
        assert_eq!(balance.available, dec!(100));

        let balance = h.service.withdraw("alice", dec!(30)).await.unwrap();
        assert_eq!(balance.available, dec!(70));

        let ids = h.ledger.submitted_command_ids();
        assert!(ids.iter().any(|id| id.starts_with("deposit-")));
        assert!(ids.iter().any(|id| id.starts_with("withdraw-")));
    }

    #[tokio::test]
    async fn test_ledger_failure_leaves_projection_untouched() {
        let h = setup().await;
        h.service.open_account("alice").await.unwrap();
        h.service.deposit("alice", dec!(50)).await.unwrap();

        h.ledger.fail_next_submits(1);
        let err = h.service.deposit("alice", dec!(25)).await.unwrap_err();
        assert!(matches!(err, CoreError::LedgerRejected(_)));

        let balance = h.service.get_balance("alice").await.unwrap();
        assert_eq!(balance.available, dec!(50));
    }

    #[tokio::test]
    async fn test_withdraw_checks_available() {
        let h = setup().await;
        h.service.open_account("alice").await.unwrap();
        h.service.deposit("alice", dec!(10)).await.unwrap();

        let err = h.service.withdraw("alice", dec!(11)).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    }

    #[tokio::test]
    async fn test_faucet_daily_cap() {
        let h = setup().await;
        h.service.open_account("alice").await.unwrap();

        for _ in 0..FAUCET_DAILY_LIMIT {
            h.service.faucet("alice", dec!(10)).await.unwrap();
        }
        let err = h.service.faucet("alice", dec!(10)).await.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_duplicate_open_conflicts() {
        let h = setup().await;
        h.service.open_account("alice").await.unwrap();
        let err = h.service.open_account("alice").await.unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_EXISTS");
    }
}
