//! Daml Template Catalogue
//!
//! Template ids follow `#<packageName>:<Module.Path>:<Template>`. Payloads
//! arrive as loose JSON from the ledger; each template gets an explicit
//! schema decoded here. Unknown fields are dropped with a warning rather
//! than failing the stream.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::LedgerError;

pub const TRADING_ACCOUNT: &str = "#pebble:Pebble.Account:TradingAccount";
pub const TRADING_ACCOUNT_REQUEST: &str = "#pebble:Pebble.Account:TradingAccountRequest";
pub const PEBBLE_AUTHORIZATION: &str = "#pebble:Pebble.Account:PebbleAuthorization";
pub const MARKET: &str = "#pebble:Pebble.Market:Market";
pub const POSITION: &str = "#pebble:Pebble.Position:Position";
pub const POSITION_MERGE: &str = "#pebble:Pebble.Position:PositionMerge";
pub const SETTLEMENT_PROPOSAL: &str = "#pebble:Pebble.Settlement:SettlementProposal";
pub const SETTLEMENT_PROPOSAL_ACCEPTED: &str =
    "#pebble:Pebble.Settlement:SettlementProposalAccepted";
pub const SETTLEMENT: &str = "#pebble:Pebble.Settlement:Settlement";
pub const MARKET_SETTLEMENT: &str = "#pebble:Pebble.Settlement:MarketSettlement";

/// Bare template name, ignoring the package qualifier. Streams from
/// different package versions keep routing correctly.
pub fn template_name(template_id: &str) -> &str {
    template_id.rsplit(':').next().unwrap_or(template_id)
}

/// Decode a template payload, dropping unknown fields with a warning.
pub fn decode_payload<T>(template_id: &str, payload: &Value) -> Result<T, LedgerError>
where
    T: DeserializeOwned + Serialize,
{
    let decoded: T = serde_json::from_value(payload.clone()).map_err(|e| {
        LedgerError::Decode(format!("payload for {template_id} did not match schema: {e}"))
    })?;

    if let (Some(raw), Ok(Value::Object(known))) =
        (payload.as_object(), serde_json::to_value(&decoded))
    {
        let dropped: Vec<&String> = raw.keys().filter(|k| !known.contains_key(*k)).collect();
        if !dropped.is_empty() {
            tracing::warn!(
                template = template_id,
                fields = ?dropped,
                "dropping unknown payload fields"
            );
        }
    }

    Ok(decoded)
}

/// `TradingAccount`: balances are authoritative on the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingAccountPayload {
    pub owner: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked_balance: Decimal,
}

/// `Position` evolves UTXO-style, one active contract per holding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionPayload {
    pub owner: String,
    pub market_id: String,
    /// "yes" | "no"
    pub side: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked_quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_cost_basis: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPayload {
    pub market_id: String,
    pub question: String,
    #[serde(default)]
    pub description: String,
    pub resolution_time: chrono::DateTime<chrono::Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSettlementPayload {
    pub market_id: String,
    pub outcome: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_template_name() {
        assert_eq!(template_name(TRADING_ACCOUNT), "TradingAccount");
        assert_eq!(template_name("TradingAccount"), "TradingAccount");
    }

    #[test]
    fn test_decode_trading_account() {
        let payload = json!({
            "owner": "alice",
            "availableBalance": "120.50",
            "lockedBalance": "4.25",
        });
        let decoded: TradingAccountPayload =
            decode_payload(TRADING_ACCOUNT, &payload).unwrap();
        assert_eq!(decoded.owner, "alice");
        assert_eq!(decoded.available_balance, dec!(120.50));
        assert_eq!(decoded.locked_balance, dec!(4.25));
    }

    #[test]
    fn test_decode_drops_unknown_fields() {
        let payload = json!({
            "owner": "bob",
            "availableBalance": "0",
            "lockedBalance": "0",
            "someFutureField": true,
        });
        // Unknown field is dropped, not an error
        let decoded: TradingAccountPayload =
            decode_payload(TRADING_ACCOUNT, &payload).unwrap();
        assert_eq!(decoded.owner, "bob");
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let payload = json!({ "owner": "bob" });
        let result: Result<TradingAccountPayload, _> =
            decode_payload(TRADING_ACCOUNT, &payload);
        assert!(result.is_err());
    }
}
