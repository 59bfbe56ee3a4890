//! Registry of deployed contracts.
//!
//! Each contract lives behind its own mutex so operations on one contract
//! are serialized while different contracts proceed in parallel. The id map
//! itself sits behind an `RwLock` that is never held while waiting on a
//! contract lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value as Json;
use tracing::{debug, info};

use super::contract::Contract;
use super::state::ContractState;
use super::store::{ContractStore, MemoryStore, StoreError};
use super::transaction::TransactionRecord;
use super::{ContractError, ContractInfo, ContractResult, ExecutionOutcome, MethodCall};
use crate::sandbox::SandboxExecutor;
use crate::types::{Address, Clock, ContractId, IdGenerator, RandomIds, SystemClock};

/// Fresh ids drawn before deploy gives up
const MAX_ID_ATTEMPTS: usize = 16;

/// `None` once the contract has been deleted
type Slot = Arc<Mutex<Option<Contract>>>;

/// Owns every deployed contract and routes operations to them.
///
/// Note: Cannot derive Clone or Debug because it contains trait objects
pub struct ContractRegistry {
    contracts: RwLock<HashMap<ContractId, Slot>>,
    executor: SandboxExecutor,
    store: Arc<dyn ContractStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl ContractRegistry {
    /// Create an empty registry backed by memory
    #[must_use]
    pub fn new(executor: SandboxExecutor) -> Self {
        Self {
            contracts: RwLock::new(HashMap::new()),
            executor,
            store: Arc::new(MemoryStore::new()),
            ids: Arc::new(RandomIds),
            clock: Arc::new(SystemClock),
        }
    }

    /// Restore a registry from a store, checking every record's hash
    ///
    /// # Errors
    /// `Storage` if records cannot be read; `IntegrityViolation` if one
    /// was altered outside the engine
    pub fn open(executor: SandboxExecutor, store: Arc<dyn ContractStore>) -> ContractResult<Self> {
        let registry = Self::new(executor).with_store(store);
        let restored = registry.store.load_all()?;
        {
            let mut map = registry.write_map();
            for contract in restored {
                contract.verify()?;
                map.insert(contract.id().clone(), Arc::new(Mutex::new(Some(contract))));
            }
            info!(contracts = map.len(), "Contract registry restored");
        }
        Ok(registry)
    }

    /// Use a different store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ContractStore>) -> Self {
        self.store = store;
        self
    }

    /// Use a different id source
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Use a different clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The executor contract code runs in
    #[must_use]
    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Deploy new contract code.
    ///
    /// # Errors
    /// `InvalidCode` if the code does not parse, `InvalidParams` for
    /// malformed init params or an empty owner, `Storage` if the record
    /// cannot be written
    pub fn deploy(
        &self,
        code: &str,
        name: &str,
        owner: &Address,
        init_params: Option<&Json>,
    ) -> ContractResult<Contract> {
        if owner.is_empty() {
            return Err(ContractError::InvalidParams(
                "owner must not be empty".to_string(),
            ));
        }
        self.executor.check(code)?;
        let state = ContractState::from_init(init_params)?;

        let mut map = self.write_map();
        let id = (0..MAX_ID_ATTEMPTS)
            .map(|_| self.ids.next_id())
            .find(|id| !map.contains_key(id))
            .ok_or_else(|| {
                StoreError::Conflict("could not allocate an unused contract id".to_string())
            })?;

        let contract = Contract::new(
            id.clone(),
            code.to_string(),
            name.to_string(),
            owner.clone(),
            self.clock.now(),
            state,
        );
        self.store.save(&contract)?;
        map.insert(id, Arc::new(Mutex::new(Some(contract.clone()))));

        info!(
            contract_id = %contract.id(),
            name = %contract.name(),
            owner = %contract.owner(),
            "Contract deployed"
        );
        Ok(contract)
    }

    /// Snapshot of a contract
    ///
    /// # Errors
    /// `NotFound` if no such contract exists
    pub fn get(&self, id: &ContractId) -> ContractResult<Contract> {
        let slot = self.slot(id)?;
        let guard = lock(&slot);
        guard
            .clone()
            .ok_or_else(|| ContractError::NotFound(id.clone()))
    }

    /// Run a contract method.
    ///
    /// A call the contract code rejects is an `Ok` [`ExecutionOutcome::Failure`].
    ///
    /// # Errors
    /// `NotFound`; `InvalidAmount` if `value` would overflow the balance;
    /// `Storage` if the committed contract cannot be written
    pub fn execute(
        &self,
        id: &ContractId,
        method: &str,
        params: Json,
        sender: &Address,
        value: u64,
    ) -> ContractResult<ExecutionOutcome> {
        let call = MethodCall::new(method, params, sender.clone()).with_value(value);
        self.mutate(id, |contract| {
            contract.execute(&self.executor, self.clock.as_ref(), call)
        })
    }

    /// Pay out of a contract's balance
    ///
    /// # Errors
    /// `NotFound`, `Unauthorized`, `InvalidAmount`, `InsufficientBalance`
    /// or `Storage`
    pub fn transfer(
        &self,
        id: &ContractId,
        to: &Address,
        amount: u64,
        sender: &Address,
    ) -> ContractResult<TransactionRecord> {
        self.mutate(id, |contract| {
            contract.transfer(self.clock.as_ref(), to.clone(), amount, sender)
        })
    }

    /// Replace a contract's code
    ///
    /// # Errors
    /// `NotFound`, `Unauthorized`, `InvalidCode` or `Storage`
    pub fn update(
        &self,
        id: &ContractId,
        new_code: &str,
        sender: &Address,
    ) -> ContractResult<ContractInfo> {
        let info = self.mutate(id, |contract| {
            contract.update(&self.executor, new_code.to_string(), sender)?;
            Ok(contract.info())
        })?;
        info!(contract_id = %id, version = info.version, "Contract code updated");
        Ok(info)
    }

    /// Remove a contract permanently, history included
    ///
    /// # Errors
    /// `NotFound`, `Unauthorized` unless `sender` is the owner, or `Storage`
    pub fn delete(&self, id: &ContractId, sender: &Address) -> ContractResult<()> {
        let slot = self.slot(id)?;
        let mut guard = lock(&slot);
        let contract = guard
            .as_ref()
            .ok_or_else(|| ContractError::NotFound(id.clone()))?;
        if contract.owner() != sender {
            return Err(ContractError::Unauthorized(format!(
                "{sender} may not delete contract {id}"
            )));
        }

        self.store.remove(id)?;
        *guard = None;
        self.write_map().remove(id);

        info!(contract_id = %id, "Contract deleted");
        Ok(())
    }

    /// Summaries of every contract, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<ContractInfo> {
        self.collect_infos(|_| true)
    }

    /// Summaries of the contracts `owner` deployed, oldest first
    #[must_use]
    pub fn list_by_owner(&self, owner: &Address) -> Vec<ContractInfo> {
        self.collect_infos(|c| c.owner() == owner)
    }

    /// Number of live contracts
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    /// Check if no contracts are deployed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a contract exists
    #[must_use]
    pub fn contains(&self, id: &ContractId) -> bool {
        self.read_map().contains_key(id)
    }

    /// Flush the store; call before shutdown
    ///
    /// # Errors
    /// `Storage` if the flush fails
    pub fn close(&self) -> ContractResult<()> {
        self.store.flush()?;
        debug!(contracts = self.len(), "Contract registry flushed");
        Ok(())
    }

    /// Apply `op` to a copy of the contract and swap it in once stored.
    /// Nothing changes if `op` fails or leaves the version alone.
    fn mutate<T>(
        &self,
        id: &ContractId,
        op: impl FnOnce(&mut Contract) -> ContractResult<T>,
    ) -> ContractResult<T> {
        let slot = self.slot(id)?;
        let mut guard = lock(&slot);
        let current = guard
            .as_ref()
            .ok_or_else(|| ContractError::NotFound(id.clone()))?;

        let mut next = current.clone();
        let out = op(&mut next)?;
        if next.version() != current.version() {
            self.store.save(&next)?;
            *guard = Some(next);
        }
        Ok(out)
    }

    fn collect_infos(&self, keep: impl Fn(&Contract) -> bool) -> Vec<ContractInfo> {
        let slots: Vec<Slot> = self.read_map().values().cloned().collect();
        let mut infos: Vec<ContractInfo> = slots
            .iter()
            .filter_map(|slot| lock(slot).as_ref().filter(|c| keep(c)).map(Contract::info))
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    fn slot(&self, id: &ContractId) -> ContractResult<Slot> {
        self.read_map()
            .get(id)
            .cloned()
            .ok_or_else(|| ContractError::NotFound(id.clone()))
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<ContractId, Slot>> {
        self.contracts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<ContractId, Slot>> {
        self.contracts.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::new(SandboxExecutor::default())
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Contract>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::StoreResult;
    use crate::types::{FixedClock, SeededIds};
    use serde_json::json;

    const COUNTER: &str = r"
        function bump(p) {
            state.count = (state.count ?? 0) + (p.by ?? 1);
            return state.count;
        }
        function fail() { throw new Error('refused'); }
    ";

    fn registry() -> ContractRegistry {
        ContractRegistry::default()
            .with_id_generator(Arc::new(SeededIds::new(7)))
            .with_clock(Arc::new(FixedClock::new(1_000)))
    }

    fn owner() -> Address {
        Address::new("0xA")
    }

    /// A store that refuses every write
    struct BrokenStore;

    impl ContractStore for BrokenStore {
        fn save(&self, _: &Contract) -> StoreResult<()> {
            Err(StoreError::Conflict("read-only".to_string()))
        }
        fn remove(&self, _: &ContractId) -> StoreResult<()> {
            Err(StoreError::Conflict("read-only".to_string()))
        }
        fn load_all(&self) -> StoreResult<Vec<Contract>> {
            Ok(Vec::new())
        }
    }

    /// Always hands out the same id
    struct StuckIds;

    impl IdGenerator for StuckIds {
        fn next_id(&self) -> ContractId {
            Address::new("0xSAME")
        }
    }

    #[test]
    fn test_deploy_and_get() {
        let reg = registry();
        let c = reg.deploy(COUNTER, "Counter", &owner(), None).unwrap();
        assert_eq!(c.version(), 1);
        assert_eq!(c.created_at(), 1_000);
        assert_eq!(reg.get(c.id()).unwrap(), c);
        assert!(reg.contains(c.id()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_deploy_validation() {
        let reg = registry();
        assert!(matches!(
            reg.deploy("function (", "Bad", &owner(), None),
            Err(ContractError::InvalidCode(_))
        ));
        assert!(matches!(
            reg.deploy(COUNTER, "Bad", &owner(), Some(&json!([1]))),
            Err(ContractError::InvalidParams(_))
        ));
        assert!(matches!(
            reg.deploy(COUNTER, "Bad", &Address::new(""), None),
            Err(ContractError::InvalidParams(_))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_deploy_retries_then_gives_up_on_id_collisions() {
        let reg = ContractRegistry::default().with_id_generator(Arc::new(StuckIds));
        reg.deploy(COUNTER, "One", &owner(), None).unwrap();
        assert!(matches!(
            reg.deploy(COUNTER, "Two", &owner(), None),
            Err(ContractError::Storage(StoreError::Conflict(_)))
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_get_returns_snapshot() {
        let reg = registry();
        let id = reg.deploy(COUNTER, "Counter", &owner(), None).unwrap().id().clone();
        let before = reg.get(&id).unwrap();
        reg.execute(&id, "bump", json!({}), &owner(), 0).unwrap();
        assert_eq!(before.version(), 1);
        assert_eq!(reg.get(&id).unwrap().version(), 2);
    }

    #[test]
    fn test_execute_routes_and_commits() {
        let reg = registry();
        let id = reg.deploy(COUNTER, "Counter", &owner(), None).unwrap().id().clone();

        let outcome = reg.execute(&id, "bump", json!({"by": 5}), &owner(), 3).unwrap();
        assert_eq!(outcome.result(), Some(&json!(5)));
        let c = reg.get(&id).unwrap();
        assert_eq!((c.version(), c.balance()), (2, 3));

        let outcome = reg.execute(&id, "fail", json!({}), &owner(), 3).unwrap();
        assert!(!outcome.is_success());
        assert_eq!(reg.get(&id).unwrap(), c);

        assert!(matches!(
            reg.execute(&Address::new("0xNONE"), "bump", json!({}), &owner(), 0),
            Err(ContractError::NotFound(_))
        ));
    }

    #[test]
    fn test_transfer_and_update_route() {
        let reg = registry();
        let id = reg
            .deploy(COUNTER, "Counter", &owner(), Some(&json!({"balance": 100})))
            .unwrap()
            .id()
            .clone();

        reg.transfer(&id, &Address::new("0xB"), 40, &owner()).unwrap();
        assert!(matches!(
            reg.transfer(&id, &Address::new("0xB"), 1, &Address::new("0xC")),
            Err(ContractError::Unauthorized(_))
        ));
        let info = reg.update(&id, "function bump() { return 0; }", &owner()).unwrap();
        assert_eq!(info.version, 3);
        assert_eq!(info.balance, 60);
    }

    #[test]
    fn test_delete() {
        let reg = registry();
        let id = reg.deploy(COUNTER, "Counter", &owner(), None).unwrap().id().clone();

        assert!(matches!(
            reg.delete(&id, &Address::new("0xB")),
            Err(ContractError::Unauthorized(_))
        ));
        assert!(reg.contains(&id));

        reg.delete(&id, &owner()).unwrap();
        assert!(!reg.contains(&id));
        assert!(matches!(reg.get(&id), Err(ContractError::NotFound(_))));
        assert!(matches!(
            reg.delete(&id, &owner()),
            Err(ContractError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_is_sorted_and_filtered() {
        let clock = Arc::new(FixedClock::new(10));
        let reg = ContractRegistry::default().with_clock(clock.clone());
        let a = reg.deploy(COUNTER, "A", &owner(), None).unwrap();
        clock.advance(5);
        let b = reg.deploy(COUNTER, "B", &Address::new("0xB"), None).unwrap();
        clock.advance(5);
        let c = reg.deploy(COUNTER, "C", &owner(), None).unwrap();

        let names: Vec<_> = reg.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, ["A", "B", "C"]);

        let mine: Vec<_> = reg.list_by_owner(&owner()).into_iter().map(|i| i.id).collect();
        assert_eq!(mine, [a.id().clone(), c.id().clone()]);
        assert_eq!(reg.list_by_owner(&Address::new("0xB"))[0], b.info());
    }

    #[test]
    fn test_store_failure_keeps_memory_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry().with_store(store.clone());
        let id = reg.deploy(COUNTER, "Counter", &owner(), None).unwrap().id().clone();
        let before = reg.get(&id).unwrap();

        let reg = ContractRegistry::open(SandboxExecutor::default(), store)
            .unwrap()
            .with_store(Arc::new(BrokenStore));
        assert!(matches!(
            reg.execute(&id, "bump", json!({}), &owner(), 0),
            Err(ContractError::Storage(_))
        ));
        assert!(matches!(
            reg.delete(&id, &owner()),
            Err(ContractError::Storage(_))
        ));
        assert_eq!(reg.get(&id).unwrap(), before);
    }

    #[test]
    fn test_open_restores_and_verifies() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry().with_store(store.clone());
        let id = reg.deploy(COUNTER, "Counter", &owner(), None).unwrap().id().clone();
        reg.execute(&id, "bump", json!({}), &owner(), 0).unwrap();
        reg.close().unwrap();
        let live = reg.get(&id).unwrap();

        let restored = ContractRegistry::open(SandboxExecutor::default(), store.clone()).unwrap();
        assert_eq!(restored.get(&id).unwrap(), live);

        let mut record = serde_json::to_value(&live).unwrap();
        record["version"] = json!(99);
        let tampered: Contract = serde_json::from_value(record).unwrap();
        store.save(&tampered).unwrap();
        assert!(matches!(
            ContractRegistry::open(SandboxExecutor::default(), store),
            Err(ContractError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_concurrent_calls_are_serialized() {
        let reg = Arc::new(registry());
        let id = reg.deploy(COUNTER, "Counter", &owner(), None).unwrap().id().clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        reg.execute(&id, "bump", json!({}), &owner(), 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let c = reg.get(&id).unwrap();
        assert_eq!(c.version(), 41);
        assert_eq!(c.balance(), 40);
        assert_eq!(c.state().get("count"), Some(&json!(40)));
        assert_eq!(c.state().transactions().len(), 40);
    }
}
