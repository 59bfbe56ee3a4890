//! Capability allowlist for sandboxed contract code.
//!
//! Contract code has no ambient authority. The only way to reach host
//! functionality is `require(name)`, which resolves against this allowlist
//! and the fixed set of built-in modules; anything else fails with
//! `ModuleNotAllowed`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use sha3::Sha3_256;

use super::SandboxError;

/// Modules that can be exposed to contract code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxModule {
    /// Hash functions over strings
    Crypto,
}

impl SandboxModule {
    /// Every built-in module
    pub fn all() -> Vec<Self> {
        vec![Self::Crypto]
    }

    /// Name used with `require`
    pub fn name(&self) -> &'static str {
        match self {
            Self::Crypto => "crypto",
        }
    }

    /// Look up a module by its `require` name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().into_iter().find(|m| m.name() == name)
    }

    /// Functions exported by the module
    pub fn exports(&self) -> &'static [Digest] {
        match self {
            Self::Crypto => &[Digest::Sha256, Digest::Sha3_256, Digest::Blake3],
        }
    }
}

impl fmt::Display for SandboxModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Digest functions of the `crypto` module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Digest {
    /// SHA-256
    Sha256,
    /// SHA3-256
    Sha3_256,
    /// BLAKE3 (256-bit output)
    Blake3,
}

impl Digest {
    /// Exported function name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha3_256 => "sha3_256",
            Self::Blake3 => "blake3",
        }
    }

    /// Lowercase hex digest of `data`
    pub fn hex(&self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha3_256 => hex::encode(Sha3_256::digest(data)),
            Self::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }
}

/// Unknown module name in configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sandbox module: {0}")]
pub struct UnknownModule(pub String);

/// The set of modules a sandboxed call may `require`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleAllowlist {
    modules: BTreeSet<SandboxModule>,
}

impl ModuleAllowlist {
    /// Allow exactly these modules
    pub fn new(modules: impl IntoIterator<Item = SandboxModule>) -> Self {
        Self {
            modules: modules.into_iter().collect(),
        }
    }

    /// Allow nothing
    pub fn none() -> Self {
        Self {
            modules: BTreeSet::new(),
        }
    }

    /// Build from configured names
    ///
    /// # Errors
    /// Returns error if a name is not a built-in module
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownModule> {
        names
            .iter()
            .map(|n| {
                SandboxModule::from_name(n.as_ref()).ok_or_else(|| UnknownModule(n.as_ref().to_string()))
            })
            .collect::<Result<BTreeSet<_>, _>>()
            .map(|modules| Self { modules })
    }

    /// Check if a module is allowed
    pub fn supports(&self, module: SandboxModule) -> bool {
        self.modules.contains(&module)
    }

    /// Resolve a `require` request
    ///
    /// # Errors
    /// `ModuleNotAllowed` for unknown or non-allowlisted names
    pub fn resolve(&self, name: &str) -> Result<SandboxModule, SandboxError> {
        SandboxModule::from_name(name)
            .filter(|m| self.supports(*m))
            .ok_or_else(|| SandboxError::ModuleNotAllowed(name.to_string()))
    }

    /// Allowed module names
    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(SandboxModule::name).collect()
    }
}

impl Default for ModuleAllowlist {
    fn default() -> Self {
        Self::new(SandboxModule::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_crypto_only() {
        let allow = ModuleAllowlist::default();
        assert!(allow.resolve("crypto").is_ok());
        assert!(matches!(
            allow.resolve("fs"),
            Err(SandboxError::ModuleNotAllowed(name)) if name == "fs"
        ));
        assert_eq!(allow.names(), vec!["crypto"]);
    }

    #[test]
    fn test_empty_allowlist_denies_builtin() {
        let allow = ModuleAllowlist::none();
        assert!(matches!(
            allow.resolve("crypto"),
            Err(SandboxError::ModuleNotAllowed(_))
        ));
    }

    #[test]
    fn test_from_names() {
        assert_eq!(
            ModuleAllowlist::from_names(&["crypto"]).unwrap(),
            ModuleAllowlist::default()
        );
        assert_eq!(
            ModuleAllowlist::from_names(&["child_process"]).unwrap_err(),
            UnknownModule("child_process".to_string())
        );
    }

    #[test]
    fn test_digests() {
        assert_eq!(
            Digest::Sha256.hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            Digest::Sha3_256.hex(b"abc"),
            "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532"
        );
        assert_eq!(Digest::Blake3.hex(b"abc").len(), 64);
    }
}
