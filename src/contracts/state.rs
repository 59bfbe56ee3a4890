//! Contract state document.
//!
//! State is an open JSON object owned by the contract code, with two
//! engine-managed entries:
//! - `balance`: non-negative integer, moved only by call value and transfers
//! - `transactions`: append-only log of [`TransactionRecord`]s
//!
//! Contract code may read both but never modify them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use super::transaction::TransactionRecord;
use super::{ContractError, ContractResult};

/// Key of the engine-managed balance
pub const BALANCE_KEY: &str = "balance";

/// Key of the engine-managed transaction log
pub const TRANSACTIONS_KEY: &str = "transactions";

/// Keys contract code can read but not write
pub const MANAGED_KEYS: [&str; 2] = [BALANCE_KEY, TRANSACTIONS_KEY];

/// Largest balance representable exactly inside the sandbox (2^53)
pub const MAX_BALANCE: u64 = 1 << 53;

/// A contract's state document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Json>", into = "Map<String, Json>")]
pub struct ContractState(Map<String, Json>);

impl ContractState {
    /// Seed state from deploy-time init parameters.
    ///
    /// `init` must be an object or null. It may set a starting `balance`
    /// (a non-negative integer up to [`MAX_BALANCE`]) but not `transactions`.
    ///
    /// # Errors
    /// `InvalidParams` if the parameters break those rules
    pub fn from_init(init: Option<&Json>) -> ContractResult<Self> {
        let mut map = match init {
            None | Some(Json::Null) => Map::new(),
            Some(Json::Object(map)) => map.clone(),
            Some(other) => {
                return Err(ContractError::InvalidParams(format!(
                    "init params must be an object, got {}",
                    json_kind(other)
                )))
            }
        };
        if map.contains_key(TRANSACTIONS_KEY) {
            return Err(ContractError::InvalidParams(format!(
                "'{TRANSACTIONS_KEY}' is managed by the engine and cannot be seeded"
            )));
        }
        let balance = match map.get(BALANCE_KEY) {
            None => 0,
            Some(v) => parse_balance(v).map_err(ContractError::InvalidParams)?,
        };
        map.insert(BALANCE_KEY.to_string(), Json::from(balance));
        map.insert(TRANSACTIONS_KEY.to_string(), Json::Array(Vec::new()));
        Ok(Self(map))
    }

    /// Wrap a stored document, checking the managed entries
    ///
    /// # Errors
    /// Returns a description of the first broken rule
    pub fn from_map(map: Map<String, Json>) -> Result<Self, String> {
        let balance = map
            .get(BALANCE_KEY)
            .ok_or_else(|| format!("state is missing '{BALANCE_KEY}'"))?;
        parse_balance(balance)?;
        if !matches!(map.get(TRANSACTIONS_KEY), Some(Json::Array(_))) {
            return Err(format!("state '{TRANSACTIONS_KEY}' must be an array"));
        }
        Ok(Self(map))
    }

    /// Current balance
    #[must_use]
    pub fn balance(&self) -> u64 {
        self.0.get(BALANCE_KEY).and_then(Json::as_u64).unwrap_or(0)
    }

    /// Logged transactions, oldest first
    #[must_use]
    pub fn transactions(&self) -> &[Json] {
        match self.0.get(TRANSACTIONS_KEY) {
            Some(Json::Array(items)) => items,
            _ => &[],
        }
    }

    /// Look up a top-level entry
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    /// The whole document
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Json> {
        &self.0
    }

    /// Add to the balance
    ///
    /// # Errors
    /// `InvalidAmount` if the result would exceed [`MAX_BALANCE`]
    pub(crate) fn credit(&mut self, amount: u64) -> ContractResult<()> {
        let next = self
            .balance()
            .checked_add(amount)
            .filter(|b| *b <= MAX_BALANCE)
            .ok_or_else(|| {
                ContractError::InvalidAmount(format!(
                    "balance would exceed the maximum of {MAX_BALANCE}"
                ))
            })?;
        self.set_balance(next);
        Ok(())
    }

    /// Subtract from the balance
    ///
    /// # Errors
    /// `InsufficientBalance` if `amount` exceeds the balance
    pub(crate) fn debit(&mut self, amount: u64) -> ContractResult<()> {
        let have = self.balance();
        let next = have
            .checked_sub(amount)
            .ok_or(ContractError::InsufficientBalance { need: amount, have })?;
        self.set_balance(next);
        Ok(())
    }

    fn set_balance(&mut self, balance: u64) {
        self.0.insert(BALANCE_KEY.to_string(), Json::from(balance));
    }

    /// Append a record to the log
    pub(crate) fn push_transaction(&mut self, record: &TransactionRecord) -> ContractResult<()> {
        let entry = serde_json::to_value(record)
            .map_err(|e| ContractError::ExecutionError(format!("cannot log transaction: {e}")))?;
        match self
            .0
            .entry(TRANSACTIONS_KEY.to_string())
            .or_insert_with(|| Json::Array(Vec::new()))
        {
            Json::Array(items) => {
                items.push(entry);
                Ok(())
            }
            _ => Err(ContractError::ExecutionError(format!(
                "state '{TRANSACTIONS_KEY}' is not an array"
            ))),
        }
    }

    /// Replace everything except the managed entries, which are kept
    pub(crate) fn replace_user_fields(&mut self, mut next: Map<String, Json>) {
        for key in MANAGED_KEYS {
            match self.0.remove(key) {
                Some(v) => next.insert(key.to_string(), v),
                None => next.remove(key),
            };
        }
        self.0 = next;
    }
}

impl TryFrom<Map<String, Json>> for ContractState {
    type Error = String;

    fn try_from(map: Map<String, Json>) -> Result<Self, Self::Error> {
        Self::from_map(map)
    }
}

impl From<ContractState> for Map<String, Json> {
    fn from(state: ContractState) -> Self {
        state.0
    }
}

fn parse_balance(v: &Json) -> Result<u64, String> {
    v.as_u64()
        .filter(|b| *b <= MAX_BALANCE)
        .ok_or_else(|| format!("'{BALANCE_KEY}' must be an integer between 0 and {MAX_BALANCE}"))
}

fn json_kind(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_init_defaults() {
        let state = ContractState::from_init(None).unwrap();
        assert_eq!(state.balance(), 0);
        assert!(state.transactions().is_empty());

        let state = ContractState::from_init(Some(&json!({"greeting": "hi", "balance": 50}))).unwrap();
        assert_eq!(state.balance(), 50);
        assert_eq!(state.get("greeting"), Some(&json!("hi")));
    }

    #[test]
    fn test_from_init_rejects_bad_params() {
        for bad in [
            json!([1, 2]),
            json!("x"),
            json!({"balance": -1}),
            json!({"balance": 1.5}),
            json!({"balance": "10"}),
            json!({"transactions": []}),
        ] {
            assert!(
                matches!(
                    ContractState::from_init(Some(&bad)),
                    Err(ContractError::InvalidParams(_))
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_credit_and_debit() {
        let mut state = ContractState::from_init(None).unwrap();
        state.credit(100).unwrap();
        state.debit(40).unwrap();
        assert_eq!(state.balance(), 60);

        let err = state.debit(61).unwrap_err();
        assert!(matches!(
            err,
            ContractError::InsufficientBalance { need: 61, have: 60 }
        ));
        assert_eq!(state.balance(), 60);

        assert!(state.credit(MAX_BALANCE).is_err());
        assert_eq!(state.balance(), 60);
    }

    #[test]
    fn test_replace_user_fields_keeps_managed_entries() {
        let mut state = ContractState::from_init(Some(&json!({"balance": 5, "a": 1}))).unwrap();
        let mut next = Map::new();
        next.insert("b".to_string(), json!(2));
        next.insert(BALANCE_KEY.to_string(), json!(999));
        state.replace_user_fields(next);
        assert_eq!(state.balance(), 5);
        assert_eq!(state.get("a"), None);
        assert_eq!(state.get("b"), Some(&json!(2)));
        assert_eq!(state.transactions().len(), 0);
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: ContractState =
            serde_json::from_value(json!({"balance": 1, "transactions": []})).unwrap();
        assert_eq!(ok.balance(), 1);
        assert!(serde_json::from_value::<ContractState>(json!({"balance": 1})).is_err());
        assert!(
            serde_json::from_value::<ContractState>(json!({"balance": -3, "transactions": []}))
                .is_err()
        );
    }
}
