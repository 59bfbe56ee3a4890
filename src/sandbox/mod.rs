//! Capability-restricted execution of contract code.
//!
//! Contracts are written in ClawScript, a small JavaScript-flavoured
//! language interpreted here. A call sees exactly four injected bindings
//! (`state`, `sender`, `value`, `params`), the pure builtins, and whatever
//! the [`ModuleAllowlist`] lets `require` hand out. There is no filesystem,
//! network, process, clock or randomness access.
//!
//! Each call runs on its own thread with a fixed stack, under an
//! instruction quota, a wall-clock deadline, collection/string caps and a
//! cap on the bytes it allocates. Converting values back to JSON counts
//! against the same quotas.

mod ast;
mod builtins;
mod capabilities;
mod interpreter;
mod lexer;
mod limits;
mod parser;
mod value;

use std::any::Any;
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;

pub use capabilities::{Digest, ModuleAllowlist, SandboxModule, UnknownModule};
pub use limits::{
    SandboxLimits, DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_COLLECTION_LEN, DEFAULT_MAX_MEMORY,
    DEFAULT_MAX_STEPS, DEFAULT_MAX_STRING_LEN, DEFAULT_STACK_SIZE, DEFAULT_TIMEOUT,
};
pub use parser::{ParseError, MAX_NESTING};

use interpreter::Interpreter;
use value::Value;

/// Names of the bindings injected into every call
pub const BINDING_STATE: &str = "state";
/// Caller identity
pub const BINDING_SENDER: &str = "sender";
/// Value attached to the call
pub const BINDING_VALUE: &str = "value";
/// Call parameters
pub const BINDING_PARAMS: &str = "params";

/// Failure of a sandboxed call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SandboxError {
    /// The code has no top-level function with this name
    #[error("method not found: {0}")]
    MethodNotFound(String),
    /// `require` of a module outside the allowlist
    #[error("module not allowed: {0}")]
    ModuleNotAllowed(String),
    /// Uncaught exception or runtime type error
    #[error("execution error: {0}")]
    Execution(String),
    /// Wall-clock deadline passed
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
    /// Instruction quota exhausted
    #[error("instruction quota of {0} steps exhausted")]
    StepLimit(u64),
    /// Collection, string or allocation cap exceeded
    #[error("memory quota exceeded: {0}")]
    MemoryLimit(String),
}

impl SandboxError {
    /// Whether the call was cut off by a resource bound
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::StepLimit(_) | Self::MemoryLimit(_)
        )
    }

    /// Prefix an execution error's message; quota breaches pass through
    pub(crate) fn context(self, what: &str) -> Self {
        match self {
            Self::Execution(m) => Self::Execution(format!("{what}: {m}")),
            other => other,
        }
    }
}

/// Inputs of one sandboxed method call
#[derive(Debug, Clone)]
pub struct SandboxCall {
    /// Function to invoke
    pub method: String,
    /// Passed as the single argument and bound read-only as `params`
    pub params: Json,
    /// Caller identity, bound read-only as `sender`
    pub sender: String,
    /// Attached value, bound read-only as `value`
    pub value: u64,
    /// Working copy of the contract state, bound as `state`
    pub state: Map<String, Json>,
    /// Top-level state keys the code may read but not modify
    pub read_only_keys: Vec<String>,
}

/// Result of a successful sandboxed call
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutput {
    /// Return value of the method (`null` when it returns nothing)
    pub result: Json,
    /// State after the call
    pub state: Map<String, Json>,
    /// Instruction steps consumed
    pub steps: u64,
}

/// Runs contract methods inside the interpreter
#[derive(Debug, Clone, Default)]
pub struct SandboxExecutor {
    limits: SandboxLimits,
    modules: ModuleAllowlist,
}

impl SandboxExecutor {
    /// Create an executor with explicit limits and allowlist
    #[must_use]
    pub fn new(limits: SandboxLimits, modules: ModuleAllowlist) -> Self {
        Self { limits, modules }
    }

    /// Configured limits
    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Configured module allowlist
    pub fn modules(&self) -> &ModuleAllowlist {
        &self.modules
    }

    /// Check that `code` parses
    pub fn check(&self, code: &str) -> Result<(), ParseError> {
        parser::parse(code).map(|_| ())
    }

    /// Whether `code` parses and declares a top-level function `method`
    pub fn defines(&self, code: &str, method: &str) -> bool {
        parser::parse(code).is_ok_and(|program| program.defines(method))
    }

    /// Run `call.method` against `code`.
    ///
    /// The caller's data is copied in and out as JSON, so nothing the code
    /// does can reach host memory. A panic inside the interpreter is
    /// reported as an execution error.
    pub fn run(&self, code: &str, call: SandboxCall) -> Result<SandboxOutput, SandboxError> {
        let limits = self.limits;
        let modules = self.modules.clone();
        let code = code.to_owned();
        let method = call.method.clone();

        let handle = std::thread::Builder::new()
            .name("clawvm-sandbox".to_string())
            .stack_size(limits.stack_size)
            .spawn(move || execute(&code, call, limits, modules))
            .map_err(|e| SandboxError::Execution(format!("failed to start sandbox: {e}")))?;

        let outcome = handle.join().unwrap_or_else(|panic| {
            Err(SandboxError::Execution(format!(
                "sandbox aborted: {}",
                panic_message(panic.as_ref())
            )))
        });

        match &outcome {
            Ok(output) => debug!(method = %method, steps = output.steps, "Sandbox call finished"),
            Err(e) => debug!(method = %method, error = %e, "Sandbox call failed"),
        }
        outcome
    }
}

fn execute(
    code: &str,
    call: SandboxCall,
    limits: SandboxLimits,
    modules: ModuleAllowlist,
) -> Result<SandboxOutput, SandboxError> {
    let program = parser::parse(code).map_err(|e| SandboxError::Execution(e.to_string()))?;
    if !program.defines(&call.method) {
        return Err(SandboxError::MethodNotFound(call.method));
    }

    // Read-only entries are handed in frozen and must come back as the very
    // same values; the caller's JSON is restored verbatim afterwards.
    let mut fields = call.state;
    let protected: Vec<(String, Json)> = call
        .read_only_keys
        .iter()
        .filter_map(|k| fields.remove(k).map(|v| (k.clone(), v)))
        .collect();
    let state = Value::from_json(&Json::Object(fields), false);
    let mut guards = BTreeMap::new();
    if let Value::Object(obj) = &state {
        let mut props = obj.props.borrow_mut();
        for (k, v) in &protected {
            let frozen = Value::from_json(v, true);
            props.insert(k.clone(), frozen.clone());
            guards.insert(k.clone(), frozen);
        }
    }
    let params = Value::from_json(&call.params, true);

    let mut interp = Interpreter::new(limits, modules);
    interp.adopt(&state);
    interp.bind_const(BINDING_STATE, state.clone());
    interp.bind_const(BINDING_SENDER, Value::str(call.sender.as_str()));
    interp.bind_const(BINDING_VALUE, Value::Number(call.value as f64));
    interp.bind_const(BINDING_PARAMS, params.clone());

    interp.run_program(&program)?;
    let result = interp.invoke(&call.method, vec![params])?;
    let result = result
        .to_json(&mut interp)
        .map_err(|e| e.context("result is not serializable"))?;

    if let Value::Object(obj) = &state {
        let mut props = obj.props.borrow_mut();
        for key in &call.read_only_keys {
            let untouched = match (props.remove(key), guards.get(key)) {
                (None, None) => true,
                (Some(now), Some(before)) => now.strict_equals(before),
                _ => false,
            };
            if !untouched {
                return Err(SandboxError::Execution(format!(
                    "state.{key} is managed by the engine and cannot be modified"
                )));
            }
        }
    }
    let mut state = match state.to_json(&mut interp) {
        Ok(Json::Object(map)) => map,
        Ok(_) => return Err(SandboxError::Execution("state is not an object".to_string())),
        Err(e) => return Err(e.context("state is not serializable")),
    };

    state.extend(protected);

    Ok(SandboxOutput {
        result,
        state,
        steps: interp.steps(),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(method: &str, params: Json, state: Json) -> SandboxCall {
        SandboxCall {
            method: method.to_string(),
            params,
            sender: "0xA".to_string(),
            value: 5,
            state: state.as_object().cloned().unwrap_or_default(),
            read_only_keys: vec!["balance".to_string(), "transactions".to_string()],
        }
    }

    const COUNTER: &str = r"
        function increment(p) {
            state.count = (state.count ?? 0) + (p.by ?? 1);
            state.last = sender;
            return { count: state.count, paid: value };
        }
        function log() { state.transactions.push('x'); }
        function mint() { state.balance = state.balance + 1000; }
        function rewrite() { state.transactions = []; }
        function touch() { state.balance = state.balance; return state.transactions.length; }
    ";

    #[test]
    fn test_run_mutates_copy_and_returns_result() {
        let exec = SandboxExecutor::default();
        let original = json!({"count": 1, "balance": 0, "transactions": []});
        let out = exec
            .run(COUNTER, call("increment", json!({"by": 2}), original.clone()))
            .unwrap();
        assert_eq!(out.result, json!({"count": 3, "paid": 5}));
        assert_eq!(out.state["count"], json!(3));
        assert_eq!(out.state["last"], json!("0xA"));
        assert_eq!(out.state["transactions"], json!([]));
        assert!(out.steps > 0);
        // the input document was moved in and copied; the caller's copy is intact
        assert_eq!(original["count"], json!(1));
    }

    #[test]
    fn test_read_only_keys_are_frozen() {
        let exec = SandboxExecutor::default();
        let err = exec
            .run(COUNTER, call("log", json!({}), json!({"transactions": []})))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution(_)));
    }

    #[test]
    fn test_read_only_keys_cannot_be_reassigned() {
        let exec = SandboxExecutor::default();
        let state = json!({"balance": 10, "transactions": [{"n": 1}]});
        for method in ["mint", "rewrite"] {
            let err = exec
                .run(COUNTER, call(method, json!({}), state.clone()))
                .unwrap_err();
            assert!(err.to_string().contains("managed by the engine"), "{method}: {err}");
        }
        let out = exec.run(COUNTER, call("touch", json!({}), state.clone())).unwrap();
        assert_eq!(out.result, json!(1));
        assert_eq!(out.state["balance"], json!(10));
        assert_eq!(out.state["transactions"], state["transactions"]);
    }

    #[test]
    fn test_read_only_values_are_restored_verbatim() {
        // u64::MAX does not survive an f64 round trip
        let exec = SandboxExecutor::default();
        let state = json!({"transactions": [{"value": u64::MAX}]});
        let out = exec
            .run(COUNTER, call("increment", json!({}), state.clone()))
            .unwrap();
        assert_eq!(out.state["transactions"], state["transactions"]);
    }

    #[test]
    fn test_method_not_found() {
        let exec = SandboxExecutor::default();
        assert!(exec.defines(COUNTER, "increment"));
        assert!(!exec.defines(COUNTER, "missing"));
        let err = exec
            .run(COUNTER, call("missing", json!({}), json!({})))
            .unwrap_err();
        assert_eq!(err, SandboxError::MethodNotFound("missing".to_string()));
    }

    #[test]
    fn test_module_allowlist_is_enforced() {
        let code = "function h(p) { return require('crypto').blake3(p.s); }";
        let denied = SandboxExecutor::new(SandboxLimits::default(), ModuleAllowlist::none());
        assert_eq!(
            denied.run(code, call("h", json!({"s": "a"}), json!({}))).unwrap_err(),
            SandboxError::ModuleNotAllowed("crypto".to_string())
        );
        let allowed = SandboxExecutor::default();
        let out = allowed.run(code, call("h", json!({"s": "a"}), json!({}))).unwrap();
        assert_eq!(out.result.as_str().map(str::len), Some(64));
    }

    #[test]
    fn test_unserializable_state_is_rejected() {
        let code = "function f() { state.fn = f; }";
        let err = SandboxExecutor::default()
            .run(code, call("f", json!({}), json!({})))
            .unwrap_err();
        assert!(err.to_string().contains("not serializable"));
    }

    #[test]
    fn test_runaway_code_is_stopped() {
        let limits = SandboxLimits {
            max_steps: 50_000,
            ..SandboxLimits::default()
        };
        let exec = SandboxExecutor::new(limits, ModuleAllowlist::default());
        let err = exec
            .run("function spin() { while (true) {} }", call("spin", json!({}), json!({})))
            .unwrap_err();
        assert!(err.is_resource_limit());
    }

    const DOUBLING: &str = r"
        function grow(p) {
            let a = [1, 1];
            for (let i = 0; i < p.rounds; i++) a = [a, a];
            if (p.stringify) return JSON.stringify(a).length;
            if (p.join) return a.join('-').length;
            state.tree = a;
        }
    ";

    #[test]
    fn test_shared_references_cannot_expand_past_quota() {
        let exec = SandboxExecutor::default();
        for mode in ["state", "stringify", "join"] {
            let params = json!({
                "rounds": 30,
                "stringify": mode == "stringify",
                "join": mode == "join",
            });
            let err = exec
                .run(DOUBLING, call("grow", params, json!({})))
                .unwrap_err();
            assert!(err.is_resource_limit(), "{mode}: {err}");
        }
        let out = exec
            .run(DOUBLING, call("grow", json!({"rounds": 3}), json!({})))
            .unwrap();
        assert_eq!(out.state["tree"][1][0][1], json!([1, 1]));
    }

    #[test]
    fn test_parsed_json_respects_collection_limit() {
        let limits = SandboxLimits {
            max_collection_len: 100,
            ..SandboxLimits::default()
        };
        let exec = SandboxExecutor::new(limits, ModuleAllowlist::default());
        let code = "function load(p) { state.big = JSON.parse(p.text); return state.big.length; }";

        let fits = serde_json::to_string(&vec![0; 100]).unwrap();
        let out = exec.run(code, call("load", json!({"text": fits}), json!({}))).unwrap();
        assert_eq!(out.result, json!(100));

        for text in [
            serde_json::to_string(&vec![0; 101]).unwrap(),
            serde_json::to_string(&json!({"inner": vec![0; 101]})).unwrap(),
        ] {
            let err = exec
                .run(code, call("load", json!({"text": text}), json!({})))
                .unwrap_err();
            assert!(matches!(err, SandboxError::MemoryLimit(_)), "{err}");
        }
    }

    #[test]
    fn test_error_serializes_with_kind() {
        let err = SandboxError::ModuleNotAllowed("fs".to_string());
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"kind": "module_not_allowed", "detail": "fs"})
        );
    }
}
