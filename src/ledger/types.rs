use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Create a contract or exercise a choice on one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LedgerCommand {
    Create {
        template_id: String,
        payload: Value,
    },
    Exercise {
        template_id: String,
        contract_id: String,
        choice: String,
        argument: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Unique per logical operation; the ledger deduplicates on it.
    pub command_id: String,
    pub acting_party: String,
    pub command: LedgerCommand,
}

impl CommandRequest {
    pub fn create(command_id: impl Into<String>, party: impl Into<String>, template_id: &str, payload: Value) -> Self {
        Self {
            command_id: command_id.into(),
            acting_party: party.into(),
            command: LedgerCommand::Create {
                template_id: template_id.to_string(),
                payload,
            },
        }
    }

    pub fn exercise(
        command_id: impl Into<String>,
        party: impl Into<String>,
        template_id: &str,
        contract_id: impl Into<String>,
        choice: &str,
        argument: Value,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            acting_party: party.into(),
            command: LedgerCommand::Exercise {
                template_id: template_id.to_string(),
                contract_id: contract_id.into(),
                choice: choice.to_string(),
                argument,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub transaction_id: String,
    pub offset: i64,
    pub contract_id: Option<String>,
    pub exercise_result: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ContractFilter {
    pub template_id: Option<String>,
    pub party: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: String,
    pub template_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub signatories: Vec<String>,
    pub observers: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub begin_offset: i64,
    pub template_ids: Vec<String>,
    pub parties: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: EventKind,
    pub contract_id: String,
    pub template_id: String,
    /// Present for created events; archived events carry none.
    pub payload: Option<Value>,
    pub stakeholders: Vec<String>,
}

/// One ledger transaction: the atomic unit the event processor consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: String,
    pub offset: i64,
    pub events: Vec<LedgerEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyDetails {
    pub party: String,
    pub display_name: Option<String>,
    pub is_local: bool,
}
