//! Distributed Ledger Boundary
//!
//! The trading core drives an external Canton/Daml ledger through the
//! `LedgerClient` trait. The concrete client (JSON API wiring, auth) lives
//! outside this crate; everything here is the abstract surface plus typed
//! template payloads.

pub mod dev;
pub mod templates;
#[cfg(test)]
pub mod testing;
mod types;

pub use types::*;

use futures::stream::BoxStream;

use crate::errors::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The command did not durably execute as far as we know (timeout,
    /// connection refused). Off-chain state must not reflect the mutation.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger processed and refused the command.
    #[error("ledger rejected: {0}")]
    Rejected(String),

    #[error("malformed ledger payload: {0}")]
    Decode(String),
}

impl From<LedgerError> for CoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(msg) => CoreError::LedgerUnavailable(msg),
            LedgerError::Rejected(msg) => CoreError::LedgerRejected(msg),
            LedgerError::Decode(msg) => CoreError::Internal(msg),
        }
    }
}

pub type TransactionStream = BoxStream<'static, Result<TransactionEvent, LedgerError>>;

/// Abstract ledger client. Every command carries a caller-chosen
/// `command_id`; the ledger deduplicates on it, which makes retries after
/// ambiguous failures safe.
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    async fn submit_command(&self, request: CommandRequest) -> Result<CommandResult, LedgerError>;

    async fn get_active_contracts(
        &self,
        filter: ContractFilter,
    ) -> Result<Vec<Contract>, LedgerError>;

    /// Restartable from any offset; the returned stream is finite in
    /// practice (connection-bound) and the consumer reconnects.
    async fn stream_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<TransactionStream, LedgerError>;

    async fn allocate_party(
        &self,
        hint: &str,
        display_name: Option<&str>,
    ) -> Result<PartyDetails, LedgerError>;

    async fn grant_party_rights(
        &self,
        party_id: &str,
        user_id: Option<&str>,
    ) -> Result<(), LedgerError>;

    async fn get_ledger_end(&self) -> Result<i64, LedgerError>;
}
