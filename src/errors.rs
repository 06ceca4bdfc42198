//! Core Error Taxonomy
//!
//! Every operation of the trading core returns `Result<T, CoreError>`.
//! Background workers never propagate these upward; they log, bump their
//! counters, and continue.

use uuid::Uuid;

/// Errors surfaced by the trading core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {message}")]
    Validation { code: &'static str, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {message}")]
    Conflict { code: &'static str, message: String },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    #[error("Insufficient position: required {required}, available {available}")]
    InsufficientPosition { required: String, available: String },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Ledger rejected command: {0}")]
    LedgerRejected(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        CoreError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        CoreError::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn market_not_found(market_id: &str) -> Self {
        CoreError::NotFound(format!("market {market_id}"))
    }

    pub fn order_not_found(order_id: Uuid) -> Self {
        CoreError::NotFound(format!("order {order_id}"))
    }

    pub fn account_not_found(user_id: &str) -> Self {
        CoreError::NotFound(format!("account {user_id}"))
    }

    /// Stable machine code for the transport layer's error objects.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation { code, .. } => code,
            CoreError::NotFound(what) => {
                if what.starts_with("market") {
                    "MARKET_NOT_FOUND"
                } else if what.starts_with("order") {
                    "ORDER_NOT_FOUND"
                } else if what.starts_with("account") {
                    "ACCOUNT_NOT_FOUND"
                } else if what.starts_with("position") {
                    "POSITION_NOT_FOUND"
                } else {
                    "NOT_FOUND"
                }
            }
            CoreError::Conflict { code, .. } => code,
            CoreError::InsufficientFunds { .. } => "INSUFFICIENT_BALANCE",
            CoreError::InsufficientPosition { .. } => "INSUFFICIENT_POSITIONS",
            CoreError::RateLimited => "RATE_LIMIT_EXCEEDED",
            CoreError::LedgerUnavailable(_) => "CANTON_UNAVAILABLE",
            CoreError::LedgerRejected(_) => "CANTON_COMMAND_FAILED",
            CoreError::Database(_) | CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Serialized form of a core error: `{error, code, details?}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&CoreError> for ErrorBody {
    fn from(err: &CoreError) -> Self {
        let details = match err {
            CoreError::InsufficientFunds {
                required,
                available,
            }
            | CoreError::InsufficientPosition {
                required,
                available,
            } => Some(serde_json::json!({
                "required": required,
                "available": available,
            })),
            _ => None,
        };
        ErrorBody {
            error: err.to_string(),
            code: err.code().to_string(),
            details,
        }
    }
}
