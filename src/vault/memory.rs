//! In-memory Vault
//!
//! A process-local [`VaultStore`] that mimics the parts of Vault the
//! walker depends on: v1 and v2 KV mounts (including the v2 path markers
//! and write envelope), ACL policies with the two built-in ones, and a
//! call log. Used by unit tests, integration tests and benches.
//!
//! Failures can be injected per operation to exercise the retry and
//! error-tally paths.

use crate::error::{VaultError, VaultResult};
use crate::path::{self, DATA_MARKER, METADATA_MARKER};
use crate::vault::{ListEntry, MountProtocol, SecretData, VaultStore, PROTECTED_POLICIES};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Operation kinds recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Read,
    Write,
    Delete,
    ListPolicies,
    PutPolicy,
    DeletePolicy,
    MountLookup,
}

/// In-memory Vault for tests
pub struct MemoryVault {
    /// Mount name -> protocol
    mounts: RwLock<HashMap<String, MountProtocol>>,

    /// Logical path (no v2 markers) -> value
    secrets: RwLock<BTreeMap<String, SecretData>>,

    /// Policy name -> rules
    policies: RwLock<BTreeMap<String, String>>,

    /// Every call made, in order
    calls: Mutex<Vec<(Op, String)>>,

    /// Remaining failures per (operation, path)
    failures: Mutex<HashMap<(Op, String), u32>>,

    /// Remaining mount lookup failures
    lookup_failures: AtomicU64,

    /// Mount lookups made
    lookups: AtomicU64,

    /// (operation, path) pairs answered with an ACL denial
    denied: RwLock<HashSet<(Op, String)>>,

    /// Artificial latency added to every call
    latency: RwLock<Option<Duration>>,
}

impl Default for MemoryVault {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVault {
    pub fn new() -> Self {
        let policies = PROTECTED_POLICIES
            .iter()
            .map(|name| (name.to_string(), String::new()))
            .collect();

        Self {
            mounts: RwLock::new(HashMap::new()),
            secrets: RwLock::new(BTreeMap::new()),
            policies: RwLock::new(policies),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            lookup_failures: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            denied: RwLock::new(HashSet::new()),
            latency: RwLock::new(None),
        }
    }

    /// Register a KV mount
    pub fn mount(&self, name: &str, protocol: MountProtocol) {
        self.mounts.write().insert(path::sanitize(name), protocol);
    }

    /// Store a secret at its logical path (no v2 markers)
    pub fn seed(&self, logical_path: &str, data: SecretData) {
        self.secrets.write().insert(path::sanitize(logical_path), data);
    }

    /// Add a policy
    pub fn seed_policy(&self, name: &str, rules: &str) {
        self.policies.write().insert(name.to_string(), rules.to_string());
    }

    /// Value stored at a logical path
    pub fn get(&self, logical_path: &str) -> Option<SecretData> {
        self.secrets.read().get(&path::sanitize(logical_path)).cloned()
    }

    /// All logical paths currently stored
    pub fn paths(&self) -> Vec<String> {
        self.secrets.read().keys().cloned().collect()
    }

    /// Policy names currently stored
    pub fn policy_names(&self) -> Vec<String> {
        self.policies.read().keys().cloned().collect()
    }

    /// Rules of a policy
    pub fn policy(&self, name: &str) -> Option<String> {
        self.policies.read().get(name).cloned()
    }

    /// Fail the next `times` calls of `op` on `path`
    pub fn fail(&self, op: Op, path: &str, times: u32) {
        self.failures.lock().insert((op, path::sanitize(path)), times);
    }

    /// Fail the next `times` mount lookups
    pub fn fail_mount_lookups(&self, times: u64) {
        self.lookup_failures.store(times, Ordering::SeqCst);
    }

    /// Answer every `op` on `path` with a 403, as an ACL denial would
    pub fn deny(&self, op: Op, path: &str) {
        self.denied.write().insert((op, path::sanitize(path)));
    }

    /// Add latency to every call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = Some(latency);
    }

    /// Number of mount lookups made
    pub fn mount_lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Snapshot of the call log
    pub fn calls(&self) -> Vec<(Op, String)> {
        self.calls.lock().clone()
    }

    /// Paths passed to calls of `op`
    pub fn calls_of(&self, op: Op) -> Vec<String> {
        self.calls.lock()
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn record(&self, op: Op, path: &str) -> VaultResult<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        self.calls.lock().push((op, path.to_string()));

        let sanitized = path::sanitize(path);
        if self.denied.read().contains(&(op, sanitized.clone())) {
            return Err(VaultError::Status {
                method: http_method(op),
                path: sanitized,
                status: 403,
                message: "permission denied".into(),
            });
        }

        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(&(op, sanitized)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(VaultError::Injected {
                    operation: op_name(op),
                    path: path.to_string(),
                    message: "injected failure: code 503".into(),
                });
            }
        }
        Ok(())
    }

    /// Map a request path to (logical path, protocol) according to the mount
    ///
    /// Returns None when a v2 mount is addressed without the expected marker.
    fn logical(&self, request_path: &str, marker: &str) -> Option<(String, MountProtocol)> {
        let request_path = path::sanitize(request_path);
        let mount = path::mount_of(&request_path).to_string();
        let protocol = self.mounts.read()
            .get(&mount)
            .copied()
            .unwrap_or(MountProtocol::V1);

        if !protocol.is_v2() {
            return Some((request_path, protocol));
        }

        let rest = request_path.strip_prefix(&mount)?.trim_start_matches('/');
        if rest == marker {
            return Some((mount, protocol));
        }
        let logical_rest = rest.strip_prefix(&format!("{marker}/"))?;
        Some((path::join(&mount, logical_rest), protocol))
    }
}

impl VaultStore for MemoryVault {
    fn list(&self, request_path: &str) -> VaultResult<Vec<ListEntry>> {
        self.record(Op::List, request_path)?;

        let Some((logical, _)) = self.logical(request_path, METADATA_MARKER) else {
            return Ok(Vec::new());
        };

        let prefix = path::ensure_trailing_slash(&logical);
        let mut children = BTreeSet::new();
        for key in self.secrets.read().keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((dir, _)) => children.insert(format!("{dir}/")),
                    None => children.insert(rest.to_string()),
                };
            }
        }

        Ok(children.into_iter().map(ListEntry::new).collect())
    }

    fn read(&self, request_path: &str) -> VaultResult<Option<SecretData>> {
        self.record(Op::Read, request_path)?;

        let Some((logical, protocol)) = self.logical(request_path, DATA_MARKER) else {
            return Ok(None);
        };

        let value = self.secrets.read().get(&logical).cloned();
        Ok(value.map(|data| {
            if protocol.is_v2() {
                SecretData::new()
                    .with("data", data.into_value())
                    .with("metadata", json!({"version": 1, "destroyed": false}))
            } else {
                data
            }
        }))
    }

    fn write(&self, request_path: &str, data: &SecretData) -> VaultResult<()> {
        self.record(Op::Write, request_path)?;

        let Some((logical, protocol)) = self.logical(request_path, DATA_MARKER) else {
            return Err(VaultError::Status {
                method: "PUT",
                path: path::sanitize(request_path),
                status: 404,
                message: "invalid path for a versioned K/V secrets engine".into(),
            });
        };

        let stored = if protocol.is_v2() {
            match data.get("data") {
                Some(Value::Object(inner)) => SecretData::from(inner.clone()),
                _ => {
                    return Err(VaultError::Status {
                        method: "PUT",
                        path: logical,
                        status: 400,
                        message: "no data provided".into(),
                    })
                }
            }
        } else {
            data.clone()
        };

        self.secrets.write().insert(logical, stored);
        Ok(())
    }

    fn delete(&self, request_path: &str) -> VaultResult<()> {
        self.record(Op::Delete, request_path)?;

        let logical = self
            .logical(request_path, DATA_MARKER)
            .or_else(|| self.logical(request_path, METADATA_MARKER))
            .map(|(logical, _)| logical)
            .unwrap_or_else(|| path::sanitize(request_path));

        self.secrets.write().remove(&logical);
        Ok(())
    }

    fn list_policies(&self) -> VaultResult<Vec<String>> {
        self.record(Op::ListPolicies, "sys/policy")?;
        Ok(self.policy_names())
    }

    fn put_policy(&self, name: &str, rules: &str) -> VaultResult<()> {
        self.record(Op::PutPolicy, name)?;
        self.policies.write().insert(name.to_string(), rules.to_string());
        Ok(())
    }

    fn delete_policy(&self, name: &str) -> VaultResult<()> {
        self.record(Op::DeletePolicy, name)?;
        self.policies.write().remove(name);
        Ok(())
    }

    fn lookup_mount(&self, request_path: &str) -> VaultResult<(String, MountProtocol)> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.record(Op::MountLookup, request_path)?;

        let failing = self
            .lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(VaultError::Injected {
                operation: "mount lookup",
                path: request_path.to_string(),
                message: "injected failure: code 503".into(),
            });
        }

        let sanitized = path::sanitize(request_path);
        let mount = path::mount_of(&sanitized).to_string();
        match self.mounts.read().get(&mount) {
            Some(protocol) => Ok((format!("{mount}/"), *protocol)),
            None => Err(VaultError::Status {
                method: "GET",
                path: format!("sys/internal/ui/mounts/{sanitized}"),
                status: 403,
                message: "preflight capability check returned 403".into(),
            }),
        }
    }
}

fn http_method(op: Op) -> &'static str {
    match op {
        Op::List | Op::ListPolicies => "LIST",
        Op::Read | Op::MountLookup => "GET",
        Op::Write | Op::PutPolicy => "PUT",
        Op::Delete | Op::DeletePolicy => "DELETE",
    }
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::List => "list",
        Op::Read => "read",
        Op::Write => "write",
        Op::Delete => "delete",
        Op::ListPolicies => "list policies",
        Op::PutPolicy => "put policy",
        Op::DeletePolicy => "delete policy",
        Op::MountLookup => "mount lookup",
    }
}
