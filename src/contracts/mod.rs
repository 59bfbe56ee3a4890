//! Contract lifecycle: deploy, execute, transfer, update, delete.
//!
//! ## Architecture
//!
//! 1. **Contract**: code plus a JSON state document, versioned and fingerprinted
//! 2. **Sandbox**: runs one method against a working copy of the state
//! 3. **Registry**: routes operations by id and persists each commit
//!
//! ## Atomicity
//!
//! Every mutation is computed on a copy of the contract. The copy is
//! persisted and only then swapped in, so a failed call, transfer or store
//! write leaves the registered contract exactly as it was.

pub mod contract;
pub mod hash;
pub mod registry;
pub mod state;
pub mod store;
pub mod transaction;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as Json};

use crate::crypto::Hash;
use crate::sandbox::{ParseError, SandboxError};
use crate::types::{Address, ContractId, Timestamp};

pub use contract::Contract;
pub use hash::{canonical_json, HashChain, HashInput};
pub use registry::ContractRegistry;
pub use state::{ContractState, BALANCE_KEY, MANAGED_KEYS, MAX_BALANCE, TRANSACTIONS_KEY};
pub use store::{ContractStore, MemoryStore, SledStore, StoreError, StoreResult};
pub use transaction::{CallRecord, RecordKind, TransactionRecord, TransferRecord};

/// Result type for contract operations
pub type ContractResult<T> = Result<T, ContractError>;

/// Contract operation errors
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// No contract with this id
    #[error("contract not found: {0}")]
    NotFound(ContractId),

    /// The code defines no such method
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The code required a module outside the allowlist
    #[error("module not allowed: {0}")]
    ModuleNotAllowed(String),

    /// Contract code threw or broke a sandbox quota
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// Sender lacks the right for this operation
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Amount is zero or would overflow the balance cap
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Balance too low
    #[error("insufficient balance: need {need}, have {have}")]
    InsufficientBalance {
        /// Amount needed
        need: u64,
        /// Amount available
        have: u64,
    },

    /// Code does not parse
    #[error("invalid code: {0}")]
    InvalidCode(#[from] ParseError),

    /// Deploy parameters are malformed
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A stored contract's hash does not match its fields
    #[error("integrity violation in {id}: expected {expected}, stored {stored}")]
    IntegrityViolation {
        /// Contract id
        id: ContractId,
        /// Hash recomputed from the fields
        expected: Hash,
        /// Hash found in the record
        stored: Hash,
    },

    /// Persistence failed; the in-memory contract is unchanged
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<SandboxError> for ContractError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::MethodNotFound(m) => Self::MethodNotFound(m),
            SandboxError::ModuleNotAllowed(m) => Self::ModuleNotAllowed(m),
            other => Self::ExecutionError(other.to_string()),
        }
    }
}

/// Parameters of a method call
#[derive(Clone, Debug, PartialEq)]
pub struct MethodCall {
    /// Top-level function to invoke
    pub method: String,
    /// Passed to the function as its argument
    pub params: Json,
    /// Caller
    pub sender: Address,
    /// Amount credited to the contract if the call succeeds
    pub value: u64,
}

impl MethodCall {
    /// A call with no attached value
    pub fn new(method: impl Into<String>, params: Json, sender: Address) -> Self {
        Self {
            method: method.into(),
            params,
            sender,
            value: 0,
        }
    }

    /// Attach value to the call
    #[must_use]
    pub fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }
}

/// Public summary of a contract
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractInfo {
    /// Contract id
    pub id: ContractId,
    /// Display name
    pub name: String,
    /// Owner address
    pub owner: Address,
    /// Deploy time in milliseconds
    pub created_at: Timestamp,
    /// Current balance
    pub balance: u64,
    /// Current version
    pub version: u64,
    /// Current fingerprint
    pub hash: Hash,
}

/// What a method call produced.
///
/// Failures inside contract code are ordinary outcomes, not `Err`s; the
/// contract is left unchanged.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    /// Committed
    Success {
        /// Method return value
        result: Json,
        /// State after the call, managed keys included
        state: Map<String, Json>,
    },
    /// Rejected, nothing changed
    Failure {
        /// Why the sandbox gave up
        error: SandboxError,
    },
}

impl ExecutionOutcome {
    /// Whether the call committed
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Return value of a committed call
    #[must_use]
    pub fn result(&self) -> Option<&Json> {
        match self {
            Self::Success { result, .. } => Some(result),
            Self::Failure { .. } => None,
        }
    }

    /// Failure cause of a rejected call
    #[must_use]
    pub fn error(&self) -> Option<&SandboxError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error),
        }
    }

    /// Convert to a `Result`, mapping failures onto [`ContractError`]
    ///
    /// # Errors
    /// The sandbox failure, if the call did not commit
    pub fn into_result(self) -> ContractResult<Json> {
        match self {
            Self::Success { result, .. } => Ok(result),
            Self::Failure { error } => Err(error.into()),
        }
    }
}

impl Serialize for ExecutionOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        match self {
            Self::Success { result, state } => {
                map.serialize_entry("success", &true)?;
                map.serialize_entry("result", result)?;
                map.serialize_entry("state", state)?;
            }
            Self::Failure { error } => {
                map.serialize_entry("success", &false)?;
                map.serialize_entry("error", &error.to_string())?;
                map.serialize_entry("cause", error)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sandbox_errors_map_onto_contract_errors() {
        assert!(matches!(
            ContractError::from(SandboxError::MethodNotFound("f".into())),
            ContractError::MethodNotFound(m) if m == "f"
        ));
        assert!(matches!(
            ContractError::from(SandboxError::ModuleNotAllowed("fs".into())),
            ContractError::ModuleNotAllowed(m) if m == "fs"
        ));
        assert!(matches!(
            ContractError::from(SandboxError::StepLimit(10)),
            ContractError::ExecutionError(_)
        ));
    }

    #[test]
    fn test_outcome_wire_shape() {
        let ok = ExecutionOutcome::Success {
            result: json!("hi"),
            state: Map::new(),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"success": true, "result": "hi", "state": {}})
        );
        assert_eq!(ok.clone().into_result().unwrap(), json!("hi"));

        let failed = ExecutionOutcome::Failure {
            error: SandboxError::Execution("boom".into()),
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({
                "success": false,
                "error": "execution error: boom",
                "cause": {"kind": "execution", "detail": "boom"}
            })
        );
        assert!(failed.result().is_none());
        assert!(matches!(
            failed.into_result(),
            Err(ContractError::ExecutionError(_))
        ));
    }

    #[test]
    fn test_method_call_builder() {
        let call = MethodCall::new("greet", json!({}), Address::new("0xA")).with_value(3);
        assert_eq!(call.value, 3);
        assert_eq!(call.method, "greet");
    }
}
