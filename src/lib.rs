//! # `ClawVM`
//!
//! A smart contract execution engine.
//!
//! ## Architecture
//!
//! - **Contracts**: code plus a JSON state document carrying an
//!   engine-managed balance and transaction log
//! - **Sandbox**: an interpreter for ClawScript contract code with a closed
//!   capability set and hard resource quotas
//! - **Registry**: owns the deployed contracts, serializes mutations per
//!   contract and persists every commit
//!
//! ## Integrity Model
//!
//! - Every mutation runs on a copy and is swapped in only once it succeeds
//!   and has been stored
//! - Every version carries a SHA-256 fingerprint of all its fields,
//!   checked again when the registry is restored

#![forbid(unsafe_code)]
#![deny(clippy::all, rust_2018_idioms)]
#![warn(clippy::pedantic, clippy::nursery, missing_docs)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::too_many_arguments,
    // Intentional numeric casts - sandbox numbers are f64, quotas are bounded
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_lossless,
    // Const fn not always beneficial for complex types
    clippy::missing_const_for_fn,
    // Self methods kept for API consistency even if unused
    clippy::unused_self,
    // must_use on every fn is excessive
    clippy::must_use_candidate,
    // Pass by value is fine for small Copy types
    clippy::needless_pass_by_value,
    // Field naming matches domain terminology
    clippy::struct_field_names,
    // Match arms with same body are sometimes clearer separate
    clippy::match_same_arms
)]

pub mod config;
pub mod contracts;
pub mod crypto;
pub mod sandbox;
pub mod types;

pub use config::{ConfigError, EngineConfig};
pub use contracts::{
    Contract, ContractError, ContractInfo, ContractRegistry, ContractResult, ContractStore,
    ExecutionOutcome, HashChain, MemoryStore, MethodCall, SledStore, TransactionRecord,
};
pub use crypto::Hash;
pub use sandbox::{ModuleAllowlist, SandboxError, SandboxExecutor, SandboxLimits};
pub use types::{Address, Clock, ContractId, IdGenerator};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
