//! In-Process Development Ledger
//!
//! A stand-in used when no Canton endpoint is wired up: commands are
//! accepted and recorded, the active contract set is kept in memory, and
//! the transaction stream stays open without yielding. Good enough to
//! exercise the trading core end to end on a laptop; production
//! deployments inject the real JSON-API client instead.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use futures::stream;
use parking_lot::Mutex;

use super::{
    CommandRequest, CommandResult, Contract, ContractFilter, LedgerClient, LedgerCommand,
    LedgerError, PartyDetails, TransactionFilter, TransactionStream,
};

#[derive(Default)]
pub struct DevLedger {
    contracts: Mutex<Vec<Contract>>,
    offset: AtomicI64,
}

impl DevLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LedgerClient for DevLedger {
    async fn submit_command(&self, request: CommandRequest) -> Result<CommandResult, LedgerError> {
        let offset = self.offset.fetch_add(1, Ordering::SeqCst) + 1;
        let contract_id = format!("dev-{}", request.command_id);

        if let LedgerCommand::Create { template_id, payload } = &request.command {
            self.contracts.lock().push(Contract {
                contract_id: contract_id.clone(),
                template_id: template_id.clone(),
                payload: payload.clone(),
                created_at: Utc::now(),
                signatories: vec![request.acting_party.clone()],
                observers: vec![],
            });
        }

        tracing::debug!(command = %request.command_id, "dev ledger accepted command");
        Ok(CommandResult {
            transaction_id: format!("dev-tx-{offset}"),
            offset,
            contract_id: Some(contract_id),
            exercise_result: None,
        })
    }

    async fn get_active_contracts(
        &self,
        filter: ContractFilter,
    ) -> Result<Vec<Contract>, LedgerError> {
        Ok(self
            .contracts
            .lock()
            .iter()
            .filter(|c| {
                filter
                    .template_id
                    .as_deref()
                    .map_or(true, |t| c.template_id == t)
            })
            .filter(|c| {
                filter
                    .party
                    .as_deref()
                    .map_or(true, |p| c.signatories.iter().any(|s| s == p))
            })
            .cloned()
            .collect())
    }

    async fn stream_transactions(
        &self,
        _filter: TransactionFilter,
    ) -> Result<TransactionStream, LedgerError> {
        // Stays open, never yields; the processor parks until shutdown
        Ok(Box::pin(stream::pending()))
    }

    async fn allocate_party(
        &self,
        hint: &str,
        display_name: Option<&str>,
    ) -> Result<PartyDetails, LedgerError> {
        Ok(PartyDetails {
            party: hint.to_string(),
            display_name: display_name.map(str::to_string),
            is_local: true,
        })
    }

    async fn grant_party_rights(
        &self,
        _party_id: &str,
        _user_id: Option<&str>,
    ) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn get_ledger_end(&self) -> Result<i64, LedgerError> {
        Ok(self.offset.load(Ordering::SeqCst))
    }
}
