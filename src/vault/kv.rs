//! KV engine version resolution
//!
//! Vault's KV engine comes in two incompatible flavors. Version 1 stores
//! the secret at the logical path. Version 2 inserts a marker segment after
//! the mount (`data` for reads and writes, `metadata` for listings) and
//! wraps write payloads in an envelope.
//!
//! Which flavor a mount speaks is found with one lookup per mount and cached
//! for the life of the resolver. Concurrent misses on the same mount may
//! each look it up once; the first insert wins and every caller returns the
//! stored value.
//!
//! A lookup that fails for good (denied, not a KV backend) falls back to a
//! v1 mount at the first path segment. That fallback is never cached.

use crate::error::VaultResult;
use crate::path::{self, DATA_MARKER, METADATA_MARKER};
use crate::vault::{SecretData, VaultStore};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Leaf protocol spoken by a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountProtocol {
    /// Flat values at the logical path
    V1,
    /// Versioned values behind `data/` and `metadata/` markers
    V2,
}

impl MountProtocol {
    /// Parse the `options.version` field of a mount description
    pub fn from_version(version: Option<&str>) -> Self {
        match version {
            Some("2") => MountProtocol::V2,
            _ => MountProtocol::V1,
        }
    }

    pub fn is_v2(&self) -> bool {
        *self == MountProtocol::V2
    }
}

/// A resolved mount: its path (trailing `/`) and protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_path: String,
    pub protocol: MountProtocol,
}

impl MountInfo {
    /// Plain v1 mount at the first segment of `path`
    pub fn v1_at(path: &str) -> Self {
        let path = path::sanitize(path);
        Self {
            mount_path: path::ensure_trailing_slash(path::mount_of(&path)),
            protocol: MountProtocol::V1,
        }
    }

    /// Path used to list or delete `path` on this mount
    pub fn list_form(&self, path: &str) -> String {
        if self.protocol.is_v2() {
            path::insert_after_mount(path, &self.mount_path, METADATA_MARKER)
        } else {
            path::sanitize(path)
        }
    }

    /// Path used to read or write `path` on this mount
    pub fn data_form(&self, path: &str) -> String {
        if self.protocol.is_v2() {
            path::insert_after_mount(path, &self.mount_path, DATA_MARKER)
        } else {
            path::sanitize(path)
        }
    }
}

/// Session-scoped, memoized mount protocol resolver
pub struct ProtocolResolver {
    /// Store to ask on a miss
    store: Arc<dyn VaultStore>,

    /// First path segment -> resolved mount
    memo: DashMap<String, MountInfo>,

    /// Number of lookups issued (for stats and tests)
    lookups: AtomicU64,
}

impl ProtocolResolver {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self {
            store,
            memo: DashMap::new(),
            lookups: AtomicU64::new(0),
        }
    }

    /// Resolve the mount owning `path`
    pub fn resolve(&self, path: &str) -> VaultResult<MountInfo> {
        let path = path::sanitize(path);
        let mount = path::mount_of(&path).to_string();

        if let Some(hit) = self.memo.get(&mount) {
            return Ok(hit.value().clone());
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);
        let (mount_path, protocol) = self.store.lookup_mount(&path)?;
        debug!(mount = %mount, mount_path = %mount_path, ?protocol, "Mount resolved");

        let info = MountInfo {
            mount_path: path::ensure_trailing_slash(&mount_path),
            protocol,
        };

        Ok(self.memo.entry(mount).or_insert(info).value().clone())
    }

    /// Resolve, treating a permanent lookup failure as a v1 mount
    ///
    /// Transient failures are returned so the caller can retry them.
    pub fn resolve_or_v1(&self, path: &str) -> VaultResult<MountInfo> {
        match self.resolve(path) {
            Ok(info) => Ok(info),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                debug!(path = %path, error = %e, "Mount lookup failed, using path as-is");
                Ok(MountInfo::v1_at(path))
            }
        }
    }

    /// Rewrite a write request for the mount's protocol
    ///
    /// v2 paths gain the `data` marker and the payload is wrapped in the
    /// `{"data": ..., "options": {}}` envelope. v1 requests pass through.
    pub fn prepare_write(&self, path: &str, secret: SecretData) -> VaultResult<(String, SecretData)> {
        let info = self.resolve_or_v1(path)?;
        let target = info.data_form(path);
        if info.protocol.is_v2() {
            Ok((target, secret.wrap_v2()))
        } else {
            Ok((target, secret))
        }
    }

    /// Number of lookups issued so far
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Number of mounts cached
    pub fn cached_mounts(&self) -> usize {
        self.memo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryVault;

    fn resolver() -> (Arc<MemoryVault>, ProtocolResolver) {
        let vault = Arc::new(MemoryVault::new());
        vault.mount("secret", MountProtocol::V1);
        vault.mount("kv", MountProtocol::V2);
        let store: Arc<dyn VaultStore> = vault.clone();
        (vault, ProtocolResolver::new(store))
    }

    #[test]
    fn test_from_version() {
        assert_eq!(MountProtocol::from_version(Some("2")), MountProtocol::V2);
        assert_eq!(MountProtocol::from_version(Some("1")), MountProtocol::V1);
        assert_eq!(MountProtocol::from_version(None), MountProtocol::V1);
    }

    #[test]
    fn test_memoized_per_mount() {
        let (vault, resolver) = resolver();

        for path in ["kv/a", "kv/b/c", "/kv/d/"] {
            let info = resolver.resolve(path).unwrap();
            assert_eq!(info.protocol, MountProtocol::V2);
            assert_eq!(info.mount_path, "kv/");
        }
        assert_eq!(resolver.lookup_count(), 1);
        assert_eq!(vault.mount_lookups(), 1);

        resolver.resolve("secret/x").unwrap();
        assert_eq!(resolver.lookup_count(), 2);
        assert_eq!(resolver.cached_mounts(), 2);
    }

    #[test]
    fn test_prepare_write_v2() {
        let (_, resolver) = resolver();
        let (path, payload) = resolver
            .prepare_write("/kv/app/db/", SecretData::new().with("x", "y"))
            .unwrap();
        assert_eq!(path, "kv/data/app/db");
        assert_eq!(payload.unwrap_v2(), SecretData::new().with("x", "y"));
    }

    #[test]
    fn test_prepare_write_v1() {
        let (_, resolver) = resolver();
        let secret = SecretData::new().with("x", "y");
        let (path, payload) = resolver.prepare_write("secret/app", secret.clone()).unwrap();
        assert_eq!(path, "secret/app");
        assert_eq!(payload, secret);
    }

    #[test]
    fn test_mount_forms() {
        let (_, resolver) = resolver();
        let kv = resolver.resolve("kv/app").unwrap();
        assert_eq!(kv.list_form("kv/app"), "kv/metadata/app");
        assert_eq!(kv.list_form("kv"), "kv/metadata");
        assert_eq!(kv.data_form("/kv/app/"), "kv/data/app");

        let secret = resolver.resolve("secret/app").unwrap();
        assert_eq!(secret.list_form("secret/app"), "secret/app");
        assert_eq!(secret.data_form("secret/app"), "secret/app");
    }

    #[test]
    fn test_unknown_mount_falls_back_to_v1() {
        let (vault, resolver) = resolver();
        let info = resolver.resolve_or_v1("cubbyhole/app").unwrap();
        assert_eq!(info, MountInfo::v1_at("cubbyhole/app"));
        assert_eq!(info.mount_path, "cubbyhole/");
        assert_eq!(resolver.cached_mounts(), 0);

        let (path, payload) = resolver
            .prepare_write("cubbyhole/app", SecretData::new().with("k", "v"))
            .unwrap();
        assert_eq!(path, "cubbyhole/app");
        assert_eq!(payload, SecretData::new().with("k", "v"));
        assert!(vault.mount_lookups() >= 2);
    }

    #[test]
    fn test_transient_lookup_failure_is_returned() {
        let (vault, resolver) = resolver();
        vault.fail_mount_lookups(1);
        assert!(resolver.resolve_or_v1("kv/a").is_err());
        assert_eq!(resolver.resolve_or_v1("kv/a").unwrap().protocol, MountProtocol::V2);
    }

    #[test]
    fn test_lookup_failure_not_cached() {
        let (vault, resolver) = resolver();
        vault.fail_mount_lookups(1);
        assert!(resolver.resolve("kv/a").is_err());
        assert_eq!(resolver.cached_mounts(), 0);
        assert!(resolver.resolve("kv/a").is_ok());
        assert_eq!(resolver.cached_mounts(), 1);
    }
}
