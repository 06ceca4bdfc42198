//! Schema definition. Applied idempotently; `system_state.schema_version`
//! records the installed revision.

use sqlx::SqlitePool;

pub const SCHEMA_VERSION: i64 = 1;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS markets (
        id              TEXT PRIMARY KEY,
        question        TEXT NOT NULL,
        description     TEXT NOT NULL DEFAULT '',
        resolution_time TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'open',
        outcome         INTEGER,
        yes_price       TEXT NOT NULL DEFAULT '0.5',
        no_price        TEXT NOT NULL DEFAULT '0.5',
        volume_24h      TEXT NOT NULL DEFAULT '0',
        total_volume    TEXT NOT NULL DEFAULT '0',
        open_interest   TEXT NOT NULL DEFAULT '0',
        contract_id     TEXT,
        version         INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        user_id                   TEXT PRIMARY KEY,
        party_id                  TEXT NOT NULL,
        account_contract_id       TEXT,
        authorization_contract_id TEXT,
        available_balance         TEXT NOT NULL DEFAULT '0',
        locked_balance            TEXT NOT NULL DEFAULT '0',
        last_updated              TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id              TEXT PRIMARY KEY,
        market_id       TEXT NOT NULL REFERENCES markets(id),
        user_id         TEXT NOT NULL,
        side            TEXT NOT NULL,
        action          TEXT NOT NULL,
        order_type      TEXT NOT NULL,
        price           TEXT,
        quantity        TEXT NOT NULL,
        filled_quantity TEXT NOT NULL DEFAULT '0',
        status          TEXT NOT NULL DEFAULT 'pending',
        locked_amount   TEXT NOT NULL DEFAULT '0',
        idempotency_key TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        id                TEXT PRIMARY KEY,
        market_id         TEXT NOT NULL REFERENCES markets(id),
        buyer_id          TEXT NOT NULL,
        seller_id         TEXT NOT NULL,
        side              TEXT NOT NULL,
        price             TEXT NOT NULL,
        quantity          TEXT NOT NULL,
        buyer_order_id    TEXT NOT NULL,
        seller_order_id   TEXT NOT NULL,
        trade_type        TEXT NOT NULL,
        settlement_status TEXT NOT NULL DEFAULT 'pending',
        settlement_id     TEXT,
        created_at        TEXT NOT NULL,
        settled_at        TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS positions (
        id              TEXT PRIMARY KEY,
        user_id         TEXT NOT NULL,
        market_id       TEXT NOT NULL,
        side            TEXT NOT NULL,
        quantity        TEXT NOT NULL DEFAULT '0',
        locked_quantity TEXT NOT NULL DEFAULT '0',
        avg_cost_basis  TEXT NOT NULL DEFAULT '0.5',
        is_archived     INTEGER NOT NULL DEFAULT 0,
        contract_id     TEXT,
        last_updated    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settlement_batches (
        id           TEXT PRIMARY KEY,
        status       TEXT NOT NULL DEFAULT 'pending',
        retry_count  INTEGER NOT NULL DEFAULT 0,
        last_error   TEXT,
        created_at   TEXT NOT NULL,
        processed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settlement_batch_trades (
        batch_id TEXT NOT NULL REFERENCES settlement_batches(id),
        trade_id TEXT NOT NULL REFERENCES trades(id),
        PRIMARY KEY (batch_id, trade_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settlement_events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id   TEXT NOT NULL,
        status     TEXT NOT NULL,
        detail     TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS compensation_failures (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id   TEXT NOT NULL,
        trade_id   TEXT NOT NULL,
        user_id    TEXT NOT NULL,
        amount     TEXT NOT NULL,
        reason     TEXT NOT NULL,
        resolved   INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (batch_id, trade_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reconciliation_history (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id            TEXT NOT NULL,
        previous_available TEXT NOT NULL,
        previous_locked    TEXT NOT NULL,
        onchain_available  TEXT NOT NULL,
        onchain_locked     TEXT NOT NULL,
        drift              TEXT NOT NULL,
        relative_drift     TEXT NOT NULL,
        reconciled         INTEGER NOT NULL,
        created_at         TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_state (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_cache (
        idempotency_key TEXT NOT NULL,
        user_id         TEXT NOT NULL,
        response        TEXT,
        expires_at      TEXT NOT NULL,
        PRIMARY KEY (idempotency_key, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS faucet_requests (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    TEXT NOT NULL,
        amount     TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
];

const INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_orders_user ON orders (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_market ON orders (market_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status)",
    "CREATE INDEX IF NOT EXISTS idx_trades_market ON trades (market_id)",
    "CREATE INDEX IF NOT EXISTS idx_trades_settlement ON trades (settlement_status)",
    "CREATE INDEX IF NOT EXISTS idx_positions_user ON positions (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_positions_market ON positions (market_id)",
    "CREATE INDEX IF NOT EXISTS idx_positions_archived ON positions (is_archived)",
    "CREATE INDEX IF NOT EXISTS idx_faucet_user ON faucet_requests (user_id)",
];

pub async fn init(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for ddl in TABLES.iter().chain(INDICES) {
        sqlx::query(ddl).execute(pool).await?;
    }
    sqlx::query(
        "INSERT INTO system_state (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT (key) DO UPDATE SET value = ?1",
    )
    .bind(SCHEMA_VERSION.to_string())
    .execute(pool)
    .await?;
    Ok(())
}
