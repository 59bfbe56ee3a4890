//! Core types shared across the engine.

mod address;
mod id;

pub use address::Address;
pub use id::{ContractId, IdGenerator, RandomIds, SeededIds, CONTRACT_ID_BYTES};

use std::sync::atomic::{AtomicI64, Ordering};

/// Unix timestamp in milliseconds
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds
#[must_use]
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Source of timestamps for deploys and transaction records.
///
/// Contract code never sees the clock; only the engine stamps records.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        now_millis()
    }
}

/// A manually driven clock for reproducible runs
#[derive(Debug, Default)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    /// Start at the given time
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: i64) {
        self.millis.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.millis.load(Ordering::SeqCst)
    }
}
