//! Subscription Message Schema
//!
//! The wire contract with the (out-of-scope) WebSocket transport. Inbound
//! messages are tagged `subscribe | unsubscribe | auth | ping`; outbound
//! messages always carry a `type` and a timestamp.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a connection may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        channels: Option<Vec<String>>,
    },
    Unsubscribe {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        channels: Option<Vec<String>>,
    },
    Auth {
        token: String,
    },
    Ping,
}

/// Messages pushed to a connection.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl OutboundMessage {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            channel: None,
            event: None,
            data: None,
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn event(channel: &str, event: &str, data: Value) -> Self {
        Self {
            channel: Some(channel.to_string()),
            event: Some(event.to_string()),
            data: Some(data),
            ..Self::new("event")
        }
    }

    pub fn subscribed(channel: &str) -> Self {
        Self {
            channel: Some(channel.to_string()),
            ..Self::new("subscribed")
        }
    }

    pub fn unsubscribed(channel: &str) -> Self {
        Self {
            channel: Some(channel.to_string()),
            ..Self::new("unsubscribed")
        }
    }

    pub fn pong() -> Self {
        Self::new("pong")
    }

    pub fn shutdown() -> Self {
        Self::new("shutdown")
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            error: Some(format!("{code}: {message}")),
            ..Self::new("error")
        }
    }
}

/// Subscription channels. Market channels are open; user channels require
/// an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Orderbook(String),
    Trades(String),
    Positions,
    Orders,
    Balance,
}

impl Channel {
    pub fn parse(channel: &str) -> Option<Self> {
        if let Some(market_id) = channel.strip_prefix("orderbook:") {
            if market_id.is_empty() {
                return None;
            }
            return Some(Channel::Orderbook(market_id.to_string()));
        }
        if let Some(market_id) = channel.strip_prefix("trades:") {
            if market_id.is_empty() {
                return None;
            }
            return Some(Channel::Trades(market_id.to_string()));
        }
        match channel {
            "positions" => Some(Channel::Positions),
            "orders" => Some(Channel::Orders),
            "balance" => Some(Channel::Balance),
            _ => None,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Channel::Positions | Channel::Orders | Channel::Balance)
    }

    pub fn name(&self) -> String {
        match self {
            Channel::Orderbook(m) => format!("orderbook:{m}"),
            Channel::Trades(m) => format!("trades:{m}"),
            Channel::Positions => "positions".to_string(),
            Channel::Orders => "orders".to_string(),
            Channel::Balance => "balance".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!(
            Channel::parse("orderbook:mkt-1"),
            Some(Channel::Orderbook("mkt-1".into()))
        );
        assert_eq!(
            Channel::parse("trades:mkt-1"),
            Some(Channel::Trades("mkt-1".into()))
        );
        assert_eq!(Channel::parse("balance"), Some(Channel::Balance));
        assert_eq!(Channel::parse("orderbook:"), None);
        assert_eq!(Channel::parse("kline:mkt-1"), None);
    }

    #[test]
    fn test_private_channels() {
        assert!(Channel::Positions.is_private());
        assert!(Channel::Orders.is_private());
        assert!(Channel::Balance.is_private());
        assert!(!Channel::parse("trades:m").unwrap().is_private());
    }

    #[test]
    fn test_client_message_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"trades:mkt-1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }
}
