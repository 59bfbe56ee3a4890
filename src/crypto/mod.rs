//! Cryptographic primitives for `clawvm`.
//!
//! - SHA-256 for contract fingerprints
//! - SHA3-256 and BLAKE3 are exposed to contract code through the
//!   sandbox `crypto` module only

mod hash;

pub use hash::{hash_data, Hash, Hasher};

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid hash format
    #[error("invalid hash: {0}")]
    InvalidHash(String),
}
