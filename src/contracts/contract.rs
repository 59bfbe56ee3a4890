//! The versioned contract entity.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::hash::{HashChain, HashInput};
use super::state::{ContractState, MANAGED_KEYS};
use super::transaction::{CallRecord, RecordKind, TransactionRecord, TransferRecord};
use super::{ContractError, ContractInfo, ContractResult, ExecutionOutcome, MethodCall};
use crate::crypto::Hash;
use crate::sandbox::{SandboxCall, SandboxExecutor};
use crate::types::{Address, Clock, ContractId, Timestamp};

/// A deployed contract: code, state and ledger at a given version.
///
/// Every mutating operation either fails with all fields untouched or
/// succeeds with `version` bumped by one and `hash` recomputed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    id: ContractId,
    code: String,
    name: String,
    owner: Address,
    created_at: Timestamp,
    state: ContractState,
    version: u64,
    hash: Hash,
}

impl Contract {
    /// Build a fresh contract at version 1
    #[must_use]
    pub fn new(
        id: ContractId,
        code: String,
        name: String,
        owner: Address,
        created_at: Timestamp,
        state: ContractState,
    ) -> Self {
        let mut contract = Self {
            id,
            code,
            name,
            owner,
            created_at,
            state,
            version: 1,
            hash: Hash::ZERO,
        };
        contract.rehash();
        contract
    }

    /// Contract id
    #[must_use]
    pub fn id(&self) -> &ContractId {
        &self.id
    }

    /// Current source code
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner address
    #[must_use]
    pub fn owner(&self) -> &Address {
        &self.owner
    }

    /// Deploy time in milliseconds
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Current state document
    #[must_use]
    pub fn state(&self) -> &ContractState {
        &self.state
    }

    /// Current balance
    #[must_use]
    pub fn balance(&self) -> u64 {
        self.state.balance()
    }

    /// Current version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Fingerprint of the current fields
    #[must_use]
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Summary without the state document
    #[must_use]
    pub fn info(&self) -> ContractInfo {
        ContractInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            owner: self.owner.clone(),
            created_at: self.created_at,
            balance: self.balance(),
            version: self.version,
            hash: self.hash,
        }
    }

    /// Whether the stored hash matches the fields; see [`Contract::verify`]
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.verify().is_ok()
    }

    pub(crate) fn hash_input(&self) -> HashInput<'_> {
        HashInput {
            id: &self.id,
            code: &self.code,
            name: &self.name,
            owner: &self.owner,
            created_at: self.created_at,
            state: &self.state,
            version: self.version,
        }
    }

    fn rehash(&mut self) {
        self.hash = HashChain::calculate_hash(self);
    }

    fn commit_version(&mut self) {
        self.version += 1;
        self.rehash();
    }

    fn can_spend(&self, sender: &Address) -> bool {
        sender == &self.owner || sender == &self.id
    }

    /// Run `call.method` in the sandbox.
    ///
    /// Sandbox failures (missing method, disallowed module, thrown errors,
    /// quota breaches) come back as [`ExecutionOutcome::Failure`] and leave
    /// the contract untouched. On success the new state is adopted, the
    /// call is logged, `value` is credited and the version bumps.
    ///
    /// # Errors
    /// `InvalidAmount` if crediting `value` would overflow the balance cap
    pub fn execute(
        &mut self,
        executor: &SandboxExecutor,
        clock: &dyn Clock,
        call: MethodCall,
    ) -> ContractResult<ExecutionOutcome> {
        // checked up front so a successful run can always be committed
        let mut next_state = self.state.clone();
        next_state.credit(call.value)?;

        let sandbox_call = SandboxCall {
            method: call.method.clone(),
            params: call.params.clone(),
            sender: call.sender.as_str().to_string(),
            value: call.value,
            state: self.state.as_map().clone(),
            read_only_keys: MANAGED_KEYS.iter().map(ToString::to_string).collect(),
        };

        let output = match executor.run(&self.code, sandbox_call) {
            Ok(output) => output,
            Err(error) => {
                warn!(
                    contract_id = %self.id,
                    method = %call.method,
                    error = %error,
                    "Contract call failed"
                );
                return Ok(ExecutionOutcome::Failure { error });
            }
        };

        next_state.replace_user_fields(output.state);
        next_state.push_transaction(&TransactionRecord::Call(CallRecord {
            timestamp: clock.now(),
            sender: call.sender,
            method: call.method.clone(),
            params: call.params,
            value: call.value,
        }))?;

        self.state = next_state;
        self.commit_version();

        debug!(
            contract_id = %self.id,
            method = %call.method,
            steps = output.steps,
            version = self.version,
            "Contract call committed"
        );

        Ok(ExecutionOutcome::Success {
            result: output.result,
            state: self.state.as_map().clone(),
        })
    }

    /// Pay `amount` out of the contract balance to `to`.
    ///
    /// Allowed for the owner and for the contract itself.
    ///
    /// # Errors
    /// `Unauthorized`, `InvalidAmount` or `InsufficientBalance`; nothing
    /// changes in any of those cases
    pub fn transfer(
        &mut self,
        clock: &dyn Clock,
        to: Address,
        amount: u64,
        sender: &Address,
    ) -> ContractResult<TransactionRecord> {
        if !self.can_spend(sender) {
            return Err(ContractError::Unauthorized(format!(
                "{sender} may not transfer funds of contract {}",
                self.id
            )));
        }
        if amount == 0 {
            return Err(ContractError::InvalidAmount(
                "transfer amount must be positive".to_string(),
            ));
        }

        let mut next_state = self.state.clone();
        next_state.debit(amount)?;
        let record = TransactionRecord::Transfer(TransferRecord {
            timestamp: clock.now(),
            sender: self.id.clone(),
            receiver: to,
            amount,
            kind: RecordKind::Transfer,
        });
        next_state.push_transaction(&record)?;

        self.state = next_state;
        self.commit_version();
        Ok(record)
    }

    /// Replace the code, keeping state, balance and ledger.
    ///
    /// # Errors
    /// `Unauthorized` unless `sender` is the owner; `InvalidCode` if the new
    /// code does not parse
    pub fn update(
        &mut self,
        executor: &SandboxExecutor,
        new_code: String,
        sender: &Address,
    ) -> ContractResult<()> {
        if sender != &self.owner {
            return Err(ContractError::Unauthorized(format!(
                "{sender} may not update contract {}",
                self.id
            )));
        }
        executor.check(&new_code)?;
        self.code = new_code;
        self.commit_version();
        Ok(())
    }

    /// Check a restored record for internal consistency
    ///
    /// # Errors
    /// `IntegrityViolation` if the stored hash does not match the fields
    pub fn verify(&self) -> ContractResult<()> {
        let expected = HashChain::calculate_hash(self);
        if expected != self.hash {
            return Err(ContractError::IntegrityViolation {
                id: self.id.clone(),
                expected,
                stored: self.hash,
            });
        }
        Ok(())
    }
}
