//! Ledger Projections
//!
//! Read models materialised from the ledger event stream: account
//! balances, positions, and markets. Writes are idempotent upserts keyed
//! by business identity, never by contract id, because the ledger evolves
//! contracts UTXO-style (archive+create per mutation).

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::SqliteConnection;

use crate::errors::CoreError;
use crate::ledger::templates::{
    MarketPayload, MarketSettlementPayload, PositionPayload, TradingAccountPayload,
};
use crate::models::{Account, AccountRow, OrderSide};

/// Upsert the balance projection for an account contract, matching on the
/// owning party.
pub async fn upsert_account(
    conn: &mut SqliteConnection,
    contract_id: &str,
    payload: &TradingAccountPayload,
) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO accounts (user_id, party_id, account_contract_id, available_balance,
                               locked_balance, last_updated)
         VALUES (?1, ?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (user_id) DO UPDATE SET
             account_contract_id = ?2,
             available_balance = ?3,
             locked_balance = ?4,
             last_updated = ?5",
    )
    .bind(&payload.owner)
    .bind(contract_id)
    .bind(payload.available_balance.to_string())
    .bind(payload.locked_balance.to_string())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn parse_side(side: &str) -> Result<OrderSide, CoreError> {
    match side {
        "yes" => Ok(OrderSide::Yes),
        "no" => Ok(OrderSide::No),
        other => Err(CoreError::Internal(format!("unknown position side {other}"))),
    }
}

/// Upsert a position by `(owner, market, side)`; the fresh contract id
/// replaces the previous incarnation. Archival is decided here, from the
/// replacement's quantity: a rotation to zero closes the holding no matter
/// which order the archive/create pair arrives in.
pub async fn upsert_position(
    conn: &mut SqliteConnection,
    contract_id: &str,
    payload: &PositionPayload,
) -> Result<(), CoreError> {
    let side = parse_side(&payload.side)?;
    let archived = payload.quantity <= Decimal::ZERO;
    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM positions
         WHERE user_id = ?1 AND market_id = ?2 AND side = ?3 AND is_archived = 0",
    )
    .bind(&payload.owner)
    .bind(&payload.market_id)
    .bind(side)
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        Some((id,)) => {
            sqlx::query(
                "UPDATE positions SET quantity = ?1, locked_quantity = ?2, avg_cost_basis = ?3,
                        contract_id = ?4, is_archived = ?5, last_updated = ?6
                 WHERE id = ?7",
            )
            .bind(payload.quantity.to_string())
            .bind(payload.locked_quantity.to_string())
            .bind(payload.avg_cost_basis.to_string())
            .bind(contract_id)
            .bind(archived)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        }
        None => {
            sqlx::query(
                "INSERT INTO positions (id, user_id, market_id, side, quantity, locked_quantity,
                                        avg_cost_basis, is_archived, contract_id, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&payload.owner)
            .bind(&payload.market_id)
            .bind(side)
            .bind(payload.quantity.to_string())
            .bind(payload.locked_quantity.to_string())
            .bind(payload.avg_cost_basis.to_string())
            .bind(archived)
            .bind(contract_id)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Archive events carry no state to act on. Every mutation is an
/// archive+create pair and the create's upsert owns archival, keyed on
/// `(owner, market, side)` rather than contract id, so an archive on its
/// own never closes a holding.
pub async fn archive_position(
    _conn: &mut SqliteConnection,
    contract_id: &str,
) -> Result<(), CoreError> {
    tracing::debug!(contract = contract_id, "position contract archived");
    Ok(())
}

/// Market projection upsert: highest version wins, ledger metadata only;
/// trading state (status, prices, volumes) is owned off-chain.
pub async fn upsert_market(
    conn: &mut SqliteConnection,
    contract_id: &str,
    payload: &MarketPayload,
) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO markets (id, question, description, resolution_time, created_at,
                              status, contract_id, version)
         VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7)
         ON CONFLICT (id) DO UPDATE SET
             question = ?2,
             description = ?3,
             resolution_time = ?4,
             contract_id = ?6,
             version = ?7
         WHERE excluded.version >= markets.version",
    )
    .bind(&payload.market_id)
    .bind(&payload.question)
    .bind(&payload.description)
    .bind(payload.resolution_time)
    .bind(Utc::now())
    .bind(contract_id)
    .bind(payload.version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn resolve_market(
    conn: &mut SqliteConnection,
    payload: &MarketSettlementPayload,
) -> Result<(), CoreError> {
    sqlx::query(
        "UPDATE markets SET status = 'resolved', outcome = ?1, version = version + 1
         WHERE id = ?2 AND status != 'resolved'",
    )
    .bind(payload.outcome)
    .bind(&payload.market_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Accounts whose projection has not been refreshed recently; the
/// reconciliation loop re-checks these against the chain.
pub async fn stale_accounts(
    pool: &sqlx::SqlitePool,
    stale_threshold_minutes: i64,
) -> Result<Vec<Account>, CoreError> {
    let cutoff = Utc::now() - chrono::Duration::minutes(stale_threshold_minutes);
    let rows: Vec<AccountRow> = sqlx::query_as(
        "SELECT user_id, party_id, account_contract_id, authorization_contract_id,
                available_balance, locked_balance, last_updated
         FROM accounts WHERE last_updated < ?1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Account::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use rust_decimal_macros::dec;

    fn account_payload(owner: &str, available: Decimal, locked: Decimal) -> TradingAccountPayload {
        TradingAccountPayload {
            owner: owner.to_string(),
            available_balance: available,
            locked_balance: locked,
        }
    }

    fn position_payload(owner: &str, side: &str, qty: Decimal) -> PositionPayload {
        PositionPayload {
            owner: owner.to_string(),
            market_id: "mkt-1".to_string(),
            side: side.to_string(),
            quantity: qty,
            locked_quantity: Decimal::ZERO,
            avg_cost_basis: dec!(0.5),
        }
    }

    #[tokio::test]
    async fn test_account_upsert_tracks_latest_contract() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();

        upsert_account(&mut conn, "c1", &account_payload("alice", dec!(50), dec!(0)))
            .await
            .unwrap();
        upsert_account(&mut conn, "c2", &account_payload("alice", dec!(75), dec!(5)))
            .await
            .unwrap();

        let account = crate::services::balances::get_account(&mut conn, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.available_balance, dec!(75));
        assert_eq!(account.locked_balance, dec!(5));
        assert_eq!(account.account_contract_id.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_position_utxo_evolution_keeps_one_active_row() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();

        upsert_position(&mut conn, "p1", &position_payload("alice", "yes", dec!(5)))
            .await
            .unwrap();
        // Mutation: archive p1, create p2 with the new quantity
        upsert_position(&mut conn, "p2", &position_payload("alice", "yes", dec!(3)))
            .await
            .unwrap();
        archive_position(&mut conn, "p1").await.unwrap();

        let position = crate::services::positions::get_active_position(
            &mut conn,
            "alice",
            "mkt-1",
            OrderSide::Yes,
        )
        .await
        .unwrap()
        .unwrap();
        // Still active: the archive was mid-evolution, not a closure
        assert_eq!(position.quantity, dec!(3));
        assert_eq!(position.contract_id.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_closing_rotation_archives_create_first() {
        // Old contract (qty 5) rotates to a zero-quantity replacement;
        // the create lands before the archive.
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();

        upsert_position(&mut conn, "p1", &position_payload("alice", "yes", dec!(5)))
            .await
            .unwrap();
        upsert_position(&mut conn, "p2", &position_payload("alice", "yes", dec!(0)))
            .await
            .unwrap();
        archive_position(&mut conn, "p1").await.unwrap();

        assert!(crate::services::positions::get_active_position(
            &mut conn,
            "alice",
            "mkt-1",
            OrderSide::Yes
        )
        .await
        .unwrap()
        .is_none());
    }

    #[tokio::test]
    async fn test_closing_rotation_archives_archive_first() {
        // Same rotation with the archive event dispatched first; the
        // zero-quantity create must still close the holding.
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();

        upsert_position(&mut conn, "p1", &position_payload("alice", "yes", dec!(5)))
            .await
            .unwrap();
        archive_position(&mut conn, "p1").await.unwrap();
        upsert_position(&mut conn, "p2", &position_payload("alice", "yes", dec!(0)))
            .await
            .unwrap();

        assert!(crate::services::positions::get_active_position(
            &mut conn,
            "alice",
            "mkt-1",
            OrderSide::Yes
        )
        .await
        .unwrap()
        .is_none());
    }

    #[tokio::test]
    async fn test_zero_quantity_close_then_revival() {
        // A later non-zero create for the same key starts a fresh row
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();

        upsert_position(&mut conn, "p1", &position_payload("alice", "yes", dec!(0)))
            .await
            .unwrap();
        upsert_position(&mut conn, "p2", &position_payload("alice", "yes", dec!(2)))
            .await
            .unwrap();

        let position = crate::services::positions::get_active_position(
            &mut conn,
            "alice",
            "mkt-1",
            OrderSide::Yes,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.contract_id.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_market_version_last_write_wins() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();

        let mut payload = MarketPayload {
            market_id: "mkt-1".to_string(),
            question: "v2 question".to_string(),
            description: String::new(),
            resolution_time: Utc::now(),
            version: 2,
        };
        upsert_market(&mut conn, "m2", &payload).await.unwrap();

        // A stale version-1 event must not downgrade the projection
        payload.question = "v1 question".to_string();
        payload.version = 1;
        upsert_market(&mut conn, "m1", &payload).await.unwrap();
        drop(conn);

        let market = crate::services::markets::get_market(&db.pool, "mkt-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(market.question, "v2 question");
        assert_eq!(market.version, 2);
    }

    #[tokio::test]
    async fn test_resolve_market_from_settlement_event() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();

        upsert_market(
            &mut conn,
            "m1",
            &MarketPayload {
                market_id: "mkt-1".to_string(),
                question: "q".to_string(),
                description: String::new(),
                resolution_time: Utc::now(),
                version: 1,
            },
        )
        .await
        .unwrap();

        resolve_market(
            &mut conn,
            &MarketSettlementPayload {
                market_id: "mkt-1".to_string(),
                outcome: true,
            },
        )
        .await
        .unwrap();
        drop(conn);

        let market = crate::services::markets::get_market(&db.pool, "mkt-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(market.status, crate::models::MarketStatus::Resolved);
        assert_eq!(market.outcome, Some(true));
    }
}
