use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::errors::CoreError;

/// Batch lifecycle: `pending → proposing → accepting → executing →
/// completed`; any state may fall to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Proposing,
    Accepting,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Proposing => "proposing",
            BatchStatus::Accepting => "accepting",
            BatchStatus::Executing => "executing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub id: Uuid,
    pub status: BatchStatus,
    pub trade_ids: Vec<Uuid>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SettlementBatchRow {
    pub id: String,
    pub status: BatchStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl SettlementBatchRow {
    pub fn into_batch(self, trade_ids: Vec<Uuid>) -> Result<SettlementBatch, CoreError> {
        Ok(SettlementBatch {
            id: super::uuid_col(&self.id, "settlement_batches.id")?,
            status: self.status,
            trade_ids,
            retry_count: self.retry_count,
            last_error: self.last_error,
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }
}
