//! Vault access module
//!
//! The walker only needs a handful of remote primitives, captured by the
//! [`VaultStore`] trait. Two implementations live here:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   VaultStore                         │
//! │  list / read / write / delete                        │
//! │  list_policies / put_policy / delete_policy          │
//! │  lookup_mount                                         │
//! └──────────────┬───────────────────────┬──────────────┘
//!                │                       │
//!                ▼                       ▼
//!      ┌──────────────────┐    ┌──────────────────────┐
//!      │  HttpVault       │    │  MemoryVault         │
//!      │  (reqwest,       │    │  (in-process tree,   │
//!      │   blocking)      │    │   tests and benches) │
//!      └──────────────────┘    └──────────────────────┘
//! ```
//!
//! Secret payloads travel as [`SecretData`], an ordered key/value
//! container with narrow typed views for the few call sites that need to
//! look inside (policies, database configs, v2 envelopes).

mod http;
pub mod kv;
pub mod memory;

pub use http::HttpVault;
pub use kv::{MountProtocol, ProtocolResolver};
pub use memory::MemoryVault;

use crate::error::VaultResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root of the ACL policy tree
pub const POLICY_ROOT: &str = "sys/policy";

/// Root of database secrets engine connection configs
pub const DATABASE_CONFIG_ROOT: &str = "database/config";

/// Built-in policies that can be neither written nor deleted
pub const PROTECTED_POLICIES: [&str; 2] = ["default", "root"];

pub fn is_protected_policy(name: &str) -> bool {
    PROTECTED_POLICIES.contains(&name)
}

/// Policy name addressed by `sys/policy/<name>`
pub fn policy_name(path: &str) -> Option<&str> {
    path.strip_prefix(POLICY_ROOT)?
        .strip_prefix('/')
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

/// Check if `path` addresses a database connection config
pub fn is_database_config(path: &str) -> bool {
    path.strip_prefix(DATABASE_CONFIG_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| !name.is_empty())
}

/// One child returned by a list call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Entry name as returned by Vault (directories keep their trailing `/`)
    pub name: String,
}

impl ListEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Check if this entry is an internal node
    pub fn is_dir(&self) -> bool {
        crate::path::is_directory(&self.name)
    }
}

/// Remote store primitives used by the walker
///
/// Implementations must be shareable across worker threads. `read`
/// returning `Ok(None)` and `list` returning an empty vector both mean
/// "nothing here" and are never treated as hard failures by callers.
pub trait VaultStore: Send + Sync {
    /// Enumerate the immediate children of `path`
    fn list(&self, path: &str) -> VaultResult<Vec<ListEntry>>;

    /// Read the raw value at `path` (v2 responses still carry the envelope)
    fn read(&self, path: &str) -> VaultResult<Option<SecretData>>;

    /// Write `data` to `path` as-is
    fn write(&self, path: &str, data: &SecretData) -> VaultResult<()>;

    /// Delete the value at `path`
    fn delete(&self, path: &str) -> VaultResult<()>;

    /// Names of all ACL policies
    fn list_policies(&self) -> VaultResult<Vec<String>>;

    /// Create or replace a policy
    fn put_policy(&self, name: &str, rules: &str) -> VaultResult<()>;

    /// Delete a policy by name
    fn delete_policy(&self, name: &str) -> VaultResult<()>;

    /// Find the mount that owns `path` and its KV protocol
    ///
    /// Returns the mount path with a trailing `/`.
    fn lookup_mount(&self, path: &str) -> VaultResult<(String, MountProtocol)>;
}

/// Policy rules extracted from a dumped payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDefinition {
    pub rules: String,
}

/// Ordered key -> opaque value container for secret payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretData(Map<String, Value>);

impl SecretData {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from a JSON value, rejecting anything that is not an object
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Wrap as a v2 write payload: `{"data": <self>, "options": {}}`
    pub fn wrap_v2(self) -> Self {
        Self::new()
            .with("data", self.into_value())
            .with("options", Value::Object(Map::new()))
    }

    /// Unwrap a v2 read response
    ///
    /// A v2 response nests the secret under an object-valued `data` key;
    /// anything else is a v1 response and is the secret itself.
    pub fn unwrap_v2(self) -> Self {
        match self.0.get("data") {
            Some(Value::Object(inner)) => Self(inner.clone()),
            _ => self,
        }
    }

    /// View as a policy, reading `rules` (sys/policy) or `policy` (acl API)
    pub fn as_policy_definition(&self) -> Option<PolicyDefinition> {
        ["rules", "policy"].iter().find_map(|key| {
            self.0
                .get(*key)
                .and_then(Value::as_str)
                .map(|rules| PolicyDefinition {
                    rules: rules.to_string(),
                })
        })
    }

    /// View as a database connection config ready to be written back
    ///
    /// Reads of `database/config/<name>` nest connection parameters under
    /// `connection_details`; writes expect them at the top level.
    pub fn as_database_config(&self) -> SecretData {
        let mut flat = Map::new();
        for (key, value) in &self.0 {
            match (key.as_str(), value) {
                ("connection_details", Value::Object(details)) => {
                    for (k, v) in details {
                        flat.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                _ => {
                    flat.insert(key.clone(), value.clone());
                }
            }
        }
        SecretData(flat)
    }
}

impl From<Map<String, Value>> for SecretData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
