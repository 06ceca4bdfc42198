//! Account Balance Helpers
//!
//! Balances are TEXT decimals in SQLite, so every mutation is a
//! read-modify-write. The registry hands out one async mutex per user and
//! every service that touches an account's funds holds it across the
//! store transaction; multi-user mutations take guards in sorted order.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::CoreError;
use crate::models::{Account, AccountRow};

#[derive(Default)]
pub struct BalanceRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BalanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        self.handle(user_id).lock_owned().await
    }

    /// Guards for several users, acquired in sorted id order.
    pub async fn lock_many(&self, user_ids: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&str> = user_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.handle(id).lock_owned().await);
        }
        guards
    }
}

pub async fn get_account(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Option<Account>, CoreError> {
    let row: Option<AccountRow> = sqlx::query_as(
        "SELECT user_id, party_id, account_contract_id, authorization_contract_id,
                available_balance, locked_balance, last_updated
         FROM accounts WHERE user_id = ?1",
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Account::try_from).transpose()
}

/// Apply signed deltas to an account. Fails with `InsufficientFunds` when
/// available would go negative, `Internal` when locked would.
pub async fn adjust_balance(
    conn: &mut SqliteConnection,
    user_id: &str,
    delta_available: Decimal,
    delta_locked: Decimal,
) -> Result<Account, CoreError> {
    let mut account = get_account(conn, user_id)
        .await?
        .ok_or_else(|| CoreError::account_not_found(user_id))?;

    let available = account.available_balance + delta_available;
    let locked = account.locked_balance + delta_locked;

    if available < Decimal::ZERO {
        return Err(CoreError::InsufficientFunds {
            required: (-delta_available).to_string(),
            available: account.available_balance.to_string(),
        });
    }
    if locked < Decimal::ZERO {
        return Err(CoreError::Internal(format!(
            "locked balance for {user_id} would go negative ({locked})"
        )));
    }

    let now = Utc::now();
    sqlx::query(
        "UPDATE accounts SET available_balance = ?1, locked_balance = ?2, last_updated = ?3
         WHERE user_id = ?4",
    )
    .bind(available.to_string())
    .bind(locked.to_string())
    .bind(now)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    account.available_balance = available;
    account.locked_balance = locked;
    account.last_updated = now;
    Ok(account)
}

/// Move funds from available into the locked bucket, failing fast when the
/// account cannot cover it.
pub async fn lock_funds(
    conn: &mut SqliteConnection,
    user_id: &str,
    amount: Decimal,
) -> Result<Account, CoreError> {
    adjust_balance(conn, user_id, -amount, amount).await
}

/// Release previously locked funds back to available.
pub async fn unlock_funds(
    conn: &mut SqliteConnection,
    user_id: &str,
    amount: Decimal,
) -> Result<Account, CoreError> {
    adjust_balance(conn, user_id, amount, -amount).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use rust_decimal_macros::dec;

    async fn seed_account(db: &Database, user_id: &str, available: Decimal) {
        sqlx::query(
            "INSERT INTO accounts (user_id, party_id, available_balance, locked_balance, last_updated)
             VALUES (?1, ?1, ?2, '0', ?3)",
        )
        .bind(user_id)
        .bind(available.to_string())
        .bind(Utc::now())
        .execute(&db.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lock_and_unlock_round_trip() {
        let db = Database::connect_in_memory().await.unwrap();
        seed_account(&db, "alice", dec!(100)).await;

        let mut conn = db.pool.acquire().await.unwrap();
        let account = lock_funds(&mut conn, "alice", dec!(40)).await.unwrap();
        assert_eq!(account.available_balance, dec!(60));
        assert_eq!(account.locked_balance, dec!(40));

        let account = unlock_funds(&mut conn, "alice", dec!(40)).await.unwrap();
        assert_eq!(account.available_balance, dec!(100));
        assert_eq!(account.locked_balance, dec!(0));
    }

    #[tokio::test]
    async fn test_lock_rejects_overdraft() {
        let db = Database::connect_in_memory().await.unwrap();
        seed_account(&db, "alice", dec!(10)).await;

        let mut conn = db.pool.acquire().await.unwrap();
        let err = lock_funds(&mut conn, "alice", dec!(10.01)).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    }

    #[tokio::test]
    async fn test_missing_account() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();
        let err = lock_funds(&mut conn, "ghost", dec!(1)).await.unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_lock_many_orders_guards() {
        let registry = BalanceRegistry::new();
        let guards = registry.lock_many(&["bob", "alice", "bob"]).await;
        assert_eq!(guards.len(), 2);
    }
}
