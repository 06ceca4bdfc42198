//! Application Configuration
//!
//! All configuration comes from environment variables (loaded via dotenvy in
//! `main`). Every knob has a default so a bare environment boots a dev node.

use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,

    // Canton ledger endpoint
    pub canton_host: String,
    pub canton_json_port: u16,
    pub canton_use_tls: bool,
    pub canton_jwt_token: Option<String>,

    // Well-known parties
    pub admin_party: String,
    pub oracle_party: String,

    // Store
    pub database_path: String,
    pub database_wal_mode: bool,

    pub admin_key: Option<String>,

    pub settlement: SettlementConfig,
    pub event_processor: EventProcessorConfig,
    pub reconciliation: ReconciliationConfig,

    pub bootstrap_test_parties: bool,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub batch_interval_ms: u64,
    pub max_batch_size: usize,
    pub max_retries: u32,
    pub proposal_timeout_ms: u64,
    pub round_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    pub initial_reconnect_ms: u64,
    pub max_reconnect_ms: u64,
    pub reconnect_multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub interval_ms: u64,
    pub stale_threshold_minutes: i64,
    pub drift_tolerance: Decimal,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_or("PORT", 3000),
            environment: env_string("NODE_ENV", "development"),

            canton_host: env_string("CANTON_HOST", "localhost"),
            canton_json_port: env_or("CANTON_JSON_PORT", 7575),
            canton_use_tls: env_bool("CANTON_USE_TLS", false),
            canton_jwt_token: std::env::var("CANTON_JWT_TOKEN").ok(),

            admin_party: env_string("PEBBLE_ADMIN_PARTY", "pebble-admin"),
            oracle_party: env_string("ORACLE_PARTY", "pebble-oracle"),

            database_path: env_string("DATABASE_PATH", "./data/pebble.db"),
            database_wal_mode: env_bool("DATABASE_WAL_MODE", true),

            admin_key: std::env::var("ADMIN_KEY").ok(),

            settlement: SettlementConfig {
                batch_interval_ms: env_or("SETTLEMENT_BATCH_INTERVAL_MS", 2000),
                max_batch_size: env_or("SETTLEMENT_MAX_BATCH_SIZE", 50),
                max_retries: env_or("SETTLEMENT_MAX_RETRIES", 3),
                proposal_timeout_ms: env_or("SETTLEMENT_PROPOSAL_TIMEOUT_MS", 30_000),
                round_delay_ms: env_or("SETTLEMENT_ROUND_DELAY_MS", 100),
            },
            event_processor: EventProcessorConfig {
                initial_reconnect_ms: env_or("EVENT_PROCESSOR_INITIAL_RECONNECT_MS", 1000),
                max_reconnect_ms: env_or("EVENT_PROCESSOR_MAX_RECONNECT_MS", 30_000),
                reconnect_multiplier: env_or("EVENT_PROCESSOR_RECONNECT_MULTIPLIER", 2.0),
            },
            reconciliation: ReconciliationConfig {
                interval_ms: env_or("RECONCILIATION_INTERVAL_MS", 60_000),
                stale_threshold_minutes: env_or("RECONCILIATION_STALE_THRESHOLD_MINUTES", 5),
                drift_tolerance: std::env::var("RECONCILIATION_DRIFT_TOLERANCE")
                    .ok()
                    .and_then(|v| Decimal::from_str(&v).ok())
                    .unwrap_or_else(|| Decimal::new(1, 3)),
            },

            bootstrap_test_parties: env_bool("BOOTSTRAP_TEST_PARTIES", false),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 2000,
            max_batch_size: 50,
            max_retries: 3,
            proposal_timeout_ms: 30_000,
            round_delay_ms: 100,
        }
    }
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_ms: 1000,
            max_reconnect_ms: 30_000,
            reconnect_multiplier: 2.0,
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            stale_threshold_minutes: 5,
            drift_tolerance: Decimal::new(1, 3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settlement = SettlementConfig::default();
        assert_eq!(settlement.batch_interval_ms, 2000);
        assert_eq!(settlement.max_retries, 3);

        let recon = ReconciliationConfig::default();
        // 0.1% drift tolerance
        assert_eq!(recon.drift_tolerance, Decimal::new(1, 3));
    }
}
