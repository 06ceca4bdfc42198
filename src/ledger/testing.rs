//! In-test ledger double: records submitted commands, serves scripted
//! active-contract sets, and replays canned transaction batches (one batch
//! per stream connect, so reconnect behavior is exercisable).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::Utc;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    CommandRequest, CommandResult, Contract, ContractFilter, LedgerClient, LedgerError,
    PartyDetails, TransactionEvent, TransactionFilter, TransactionStream,
};

#[derive(Default)]
pub struct MockLedger {
    pub commands: Mutex<Vec<CommandRequest>>,
    contracts: Mutex<Vec<Contract>>,
    tx_batches: Mutex<VecDeque<Vec<TransactionEvent>>>,
    /// Fail this many submit_command calls before succeeding again.
    fail_submits: AtomicU32,
    /// Fail this many stream connects before succeeding.
    fail_connects: AtomicU32,
    pub connect_count: AtomicU32,
    offset: AtomicI64,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_contracts(&self, contracts: Vec<Contract>) {
        *self.contracts.lock() = contracts;
    }

    pub fn push_transaction_batch(&self, batch: Vec<TransactionEvent>) {
        self.tx_batches.lock().push_back(batch);
    }

    pub fn fail_next_submits(&self, n: u32) {
        self.fail_submits.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn submitted_command_ids(&self) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .map(|c| c.command_id.clone())
            .collect()
    }

    pub fn contract(
        contract_id: &str,
        template_id: &str,
        payload: Value,
        signatories: Vec<String>,
    ) -> Contract {
        Contract {
            contract_id: contract_id.to_string(),
            template_id: template_id.to_string(),
            payload,
            created_at: Utc::now(),
            signatories,
            observers: vec![],
        }
    }
}

#[async_trait::async_trait]
impl LedgerClient for MockLedger {
    async fn submit_command(&self, request: CommandRequest) -> Result<CommandResult, LedgerError> {
        if self
            .fail_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::Rejected("scripted failure".into()));
        }

        self.commands.lock().push(request.clone());
        let offset = self.offset.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CommandResult {
            transaction_id: format!("tx-{offset}"),
            offset,
            contract_id: Some(format!("cid-{}", request.command_id)),
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
        filter: TransactionFilter,
    ) -> Result<TransactionStream, LedgerError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::Unavailable("scripted connect failure".into()));
        }

        let batch = self.tx_batches.lock().pop_front().unwrap_or_default();
        let events: Vec<Result<TransactionEvent, LedgerError>> = batch
            .into_iter()
            .filter(|tx| tx.offset > filter.begin_offset)
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(events)))
    }

    async fn allocate_party(
        &self,
        hint: &str,
        display_name: Option<&str>,
    ) -> Result<PartyDetails, LedgerError> {
        Ok(PartyDetails {
            party: format!("{hint}::mock"),
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
