//! Contract id allocation.

use std::sync::Mutex;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use super::Address;

/// Contract ids are addresses so a contract can sign for itself.
pub type ContractId = Address;

/// Number of random bytes in a contract id
pub const CONTRACT_ID_BYTES: usize = 20;

/// Supplies collision-resistant contract identifiers.
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh id
    fn next_id(&self) -> ContractId;
}

fn format_id(bytes: [u8; CONTRACT_ID_BYTES]) -> ContractId {
    Address::new(format!("0x{}", hex::encode(bytes)))
}

/// Ids drawn from the thread-local CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&self) -> ContractId {
        let mut bytes = [0u8; CONTRACT_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        format_id(bytes)
    }
}

/// Reproducible ids from a seeded ChaCha20 stream.
#[derive(Debug)]
pub struct SeededIds {
    rng: Mutex<ChaCha20Rng>,
}

impl SeededIds {
    /// Create a generator from a seed
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }
}

impl IdGenerator for SeededIds {
    fn next_id(&self) -> ContractId {
        let mut bytes = [0u8; CONTRACT_ID_BYTES];
        self.rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .fill_bytes(&mut bytes);
        format_id(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_format() {
        let id = RandomIds.next_id();
        assert!(id.as_str().starts_with("0x"));
        assert_eq!(id.as_str().len(), 2 + CONTRACT_ID_BYTES * 2);
    }

    #[test]
    fn test_random_ids_distinct() {
        let a = RandomIds.next_id();
        let b = RandomIds.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_seeded_ids_reproducible() {
        let a = SeededIds::new(7);
        let b = SeededIds::new(7);
        assert_eq!(a.next_id(), b.next_id());
        assert_eq!(a.next_id(), b.next_id());
        assert_ne!(a.next_id(), SeededIds::new(8).next_id());
    }
}
