//! Resource bounds for a single sandboxed call.

use std::time::Duration;

/// Default instruction quota
pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;

/// Default wall-clock budget
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default nesting of contract function calls
pub const DEFAULT_MAX_CALL_DEPTH: usize = 32;

/// Default element cap for any one array or object
pub const DEFAULT_MAX_COLLECTION_LEN: usize = 10_000;

/// Default cap on string length in bytes (1 MiB)
pub const DEFAULT_MAX_STRING_LEN: usize = 1 << 20;

/// Default cap on bytes allocated over one call (128 MiB)
pub const DEFAULT_MAX_MEMORY: usize = 128 << 20;

/// Stack reserved for the sandbox thread (64 MiB)
pub const DEFAULT_STACK_SIZE: usize = 64 << 20;

/// How many steps pass between wall-clock checks
pub(crate) const CLOCK_CHECK_INTERVAL: u64 = 256;

/// Quotas enforced by the interpreter.
///
/// Any breach terminates the call and is reported as an execution error;
/// nothing the call did is committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Instruction quota (statements and expressions evaluated)
    pub max_steps: u64,
    /// Wall-clock deadline for the whole call
    pub timeout: Duration,
    /// Maximum depth of nested contract function calls
    pub max_call_depth: usize,
    /// Maximum elements in one array or entries in one object
    pub max_collection_len: usize,
    /// Maximum string length in bytes
    pub max_string_len: usize,
    /// Total bytes a call may allocate, freed or not
    pub max_memory: usize,
    /// Stack size of the dedicated sandbox thread
    pub stack_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            timeout: DEFAULT_TIMEOUT,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_collection_len: DEFAULT_MAX_COLLECTION_LEN,
            max_string_len: DEFAULT_MAX_STRING_LEN,
            max_memory: DEFAULT_MAX_MEMORY,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}
