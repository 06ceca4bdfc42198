use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::CoreError;

/// Off-chain projection of a TradingAccount contract. The ledger is
/// authoritative; reconciliation converges drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub party_id: String,
    pub account_contract_id: Option<String>,
    pub authorization_contract_id: Option<String>,
    pub available_balance: Decimal,
    pub locked_balance: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Account {
    pub fn total(&self) -> Decimal {
        self.available_balance + self.locked_balance
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub user_id: String,
    pub party_id: String,
    pub account_contract_id: Option<String>,
    pub authorization_contract_id: Option<String>,
    pub available_balance: String,
    pub locked_balance: String,
    pub last_updated: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = CoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            user_id: row.user_id,
            party_id: row.party_id,
            account_contract_id: row.account_contract_id,
            authorization_contract_id: row.authorization_contract_id,
            available_balance: super::decimal_col(
                &row.available_balance,
                "accounts.available_balance",
            )?,
            locked_balance: super::decimal_col(&row.locked_balance, "accounts.locked_balance")?,
            last_updated: row.last_updated,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceResponse {
    pub user_id: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl From<Account> for BalanceResponse {
    fn from(account: Account) -> Self {
        Self {
            user_id: account.user_id.clone(),
            available: account.available_balance,
            locked: account.locked_balance,
            total: account.total(),
        }
    }
}
