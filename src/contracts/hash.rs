//! Contract fingerprinting.
//!
//! The fingerprint covers every live field of a contract and nothing else.
//! It is recomputed from scratch after each mutation and is not linked to
//! the previous version's fingerprint.

use serde_json::{Map, Value as Json};

use super::contract::Contract;
use super::state::ContractState;
use crate::crypto::{Hash, Hasher};
use crate::types::{Address, ContractId, Timestamp};

/// Borrowed view of the fields a fingerprint covers
#[derive(Clone, Copy, Debug)]
pub struct HashInput<'a> {
    /// Contract id
    pub id: &'a ContractId,
    /// Source code
    pub code: &'a str,
    /// Display name
    pub name: &'a str,
    /// Owner address
    pub owner: &'a Address,
    /// Deploy time
    pub created_at: Timestamp,
    /// Current state document
    pub state: &'a ContractState,
    /// Current version
    pub version: u64,
}

/// Deterministic SHA-256 fingerprint over a contract's fields
pub struct HashChain;

impl HashChain {
    /// Fingerprint of a contract's current fields
    #[must_use]
    pub fn calculate_hash(contract: &Contract) -> Hash {
        Self::hash_fields(&contract.hash_input())
    }

    /// Fingerprint of an explicit field set
    #[must_use]
    pub fn hash_fields(input: &HashInput<'_>) -> Hash {
        let mut state = String::new();
        write_object(input.state.as_map(), &mut state);
        let mut hasher = Hasher::new();
        hasher
            .update_field(input.id.as_bytes())
            .update_field(input.code.as_bytes())
            .update_field(input.name.as_bytes())
            .update_field(input.owner.as_bytes())
            .update(&input.created_at.to_le_bytes())
            .update_field(state.as_bytes())
            .update(&input.version.to_le_bytes());
        hasher.finalize()
    }
}

/// Compact JSON with object keys in byte order at every level
#[must_use]
pub fn canonical_json(value: &Json) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Json, out: &mut String) {
    match value {
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Json::Object(map) => write_object(map, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(map: &Map<String, Json>, out: &mut String) {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (i, (key, item)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Json::String(key.clone()).to_string());
        out.push(':');
        write_canonical(item, out);
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let v = json!({"b": 1, "a": {"z": [1, {"y": true, "x": null}], "c": "s"}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":"s","z":[1,{"x":null,"y":true}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        assert_eq!(canonical_json(&json!({"k\"": "a\nb"})), r#"{"k\"":"a\nb"}"#);
    }

    fn input<'a>(state: &'a ContractState, id: &'a Address, owner: &'a Address) -> HashInput<'a> {
        HashInput {
            id,
            code: "function f() {}",
            name: "Greeter",
            owner,
            created_at: 1_700_000_000_000,
            state,
            version: 1,
        }
    }

    #[test]
    fn test_hash_is_deterministic_and_field_sensitive() {
        let state = ContractState::from_init(None).unwrap();
        let id = Address::new("0x01");
        let owner = Address::new("0xA");
        let base = input(&state, &id, &owner);
        assert_eq!(HashChain::hash_fields(&base), HashChain::hash_fields(&base));

        let bumped = HashInput {
            version: 2,
            ..base
        };
        assert_ne!(HashChain::hash_fields(&base), HashChain::hash_fields(&bumped));

        let renamed = HashInput {
            name: "Greeter2",
            ..base
        };
        assert_ne!(HashChain::hash_fields(&base), HashChain::hash_fields(&renamed));
    }

    #[test]
    fn test_field_boundaries_cannot_shift() {
        let state = ContractState::from_init(None).unwrap();
        let id = Address::new("0x01");
        let owner = Address::new("0xA");
        let a = HashInput {
            code: "ab",
            name: "c",
            ..input(&state, &id, &owner)
        };
        let b = HashInput {
            code: "a",
            name: "bc",
            ..input(&state, &id, &owner)
        };
        assert_ne!(HashChain::hash_fields(&a), HashChain::hash_fields(&b));
    }
}
