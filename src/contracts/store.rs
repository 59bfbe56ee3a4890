//! Contract persistence.
//!
//! The registry writes each committed contract through a [`ContractStore`]
//! before making it visible, and rebuilds itself from [`ContractStore::load_all`]
//! on start. Records are the contract's JSON serialization keyed by id.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use super::contract::Contract;
use crate::types::ContractId;

/// Name of the sled tree holding contract records
const CONTRACTS_TREE: &str = "contracts";

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Write refused because it would clash with existing data
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Durable storage for contract records
pub trait ContractStore: Send + Sync {
    /// Insert or replace a contract record
    fn save(&self, contract: &Contract) -> StoreResult<()>;

    /// Drop a contract record; missing ids are not an error
    fn remove(&self, id: &ContractId) -> StoreResult<()>;

    /// Every stored contract
    fn load_all(&self) -> StoreResult<Vec<Contract>>;

    /// Make pending writes durable
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// In-process store; records are kept serialized so that loading goes
/// through the same decoding path as a real database
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<ContractId, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContractStore for MemoryStore {
    fn save(&self, contract: &Contract) -> StoreResult<()> {
        let bytes = serde_json::to_vec(contract)?;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(contract.id().clone(), bytes);
        Ok(())
    }

    fn remove(&self, id: &ContractId) -> StoreResult<()> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    fn load_all(&self) -> StoreResult<Vec<Contract>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|bytes| Ok(serde_json::from_slice(bytes)?))
            .collect()
    }
}

/// sled-backed store
pub struct SledStore {
    db: sled::Db,
    contracts: sled::Tree,
}

impl SledStore {
    /// Open (or create) a database directory
    ///
    /// # Errors
    /// Returns error if the directory or database cannot be opened
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        Self::from_db(sled::open(path)?)
    }

    /// A database that lives only as long as this value
    ///
    /// # Errors
    /// Returns error if sled cannot create its scratch files
    pub fn temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        let contracts = db.open_tree(CONTRACTS_TREE)?;
        Ok(Self { db, contracts })
    }
}

impl ContractStore for SledStore {
    fn save(&self, contract: &Contract) -> StoreResult<()> {
        let bytes = serde_json::to_vec(contract)?;
        self.contracts.insert(contract.id().as_bytes(), bytes)?;
        Ok(())
    }

    fn remove(&self, id: &ContractId) -> StoreResult<()> {
        self.contracts.remove(id.as_bytes())?;
        Ok(())
    }

    fn load_all(&self) -> StoreResult<Vec<Contract>> {
        self.contracts
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }

    fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
