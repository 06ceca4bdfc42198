pub mod account;
pub mod market;
pub mod order;
pub mod position;
pub mod settlement;
pub mod trade;

pub use account::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use settlement::*;
pub use trade::*;

use crate::errors::CoreError;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Parse a TEXT money column. SQLite has no decimal type, so every monetary
/// column stores the canonical `rust_decimal` rendering.
pub(crate) fn decimal_col(value: &str, column: &str) -> Result<Decimal, CoreError> {
    Decimal::from_str(value)
        .map_err(|e| CoreError::Internal(format!("bad decimal in column {column}: {value} ({e})")))
}

pub(crate) fn uuid_col(value: &str, column: &str) -> Result<uuid::Uuid, CoreError> {
    uuid::Uuid::from_str(value)
        .map_err(|e| CoreError::Internal(format!("bad uuid in column {column}: {value} ({e})")))
}
