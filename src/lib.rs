//! vault-walker - Concurrent Dump, Import and Purge for Vault KV Trees
//!
//! A tool for moving whole secret trees in and out of a HashiCorp Vault
//! style store that only offers list/read/write/delete primitives.
//!
//! # Features
//!
//! - **Parallel Discovery**: every directory is an independent task on a
//!   work-stealing injector, so wide and deep trees are listed in parallel.
//!
//! - **Bounded Pipelines**: discovery, per-leaf I/O and aggregation are
//!   connected by bounded queues; memory stays flat on huge trees.
//!
//! - **KV v1 and v2**: each mount's engine version is looked up once per
//!   session and paths and payloads are rewritten to match.
//!
//! - **Retry with Jitter**: imports retry transient failures and write a
//!   replayable failure report for whatever still fails.
//!
//! - **Graceful Cancellation**: SIGINT/SIGTERM stop discovery, workers
//!   drain what is queued, and the run reports what it finished.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Vault Server                             │
//! │              (KV v1 / KV v2 mounts, sys/policy)                  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ LIST / GET / PUT / DELETE
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  VaultStore (HttpVault)  +  ProtocolResolver (per-mount memo)    │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!        ┌──────────────────────┼───────────────────────┐
//!        ▼                      ▼                       ▼
//! ┌──────────────┐      ┌───────────────┐       ┌──────────────┐
//! │ Dump         │      │ Import        │       │ Purge        │
//! │ discover →   │      │ produce →     │       │ list+delete  │
//! │ read →       │      │ write(retry)→ │       │ (injector,   │
//! │ aggregate    │      │ tally         │       │  pending)    │
//! └──────┬───────┘      └───────┬───────┘       └──────────────┘
//!        ▼                      ▼
//!   dump file / stdout     failure report
//! ```
//!
//! # Example
//!
//! ```bash
//! # Dump two trees to ./backup/vault-dump.json
//! vault-walker dump -p secret/app,kv/team -d ./backup
//!
//! # Load it back into another cluster
//! VAULT_ADDR=https://vault-b:8200 vault-walker import ./backup/vault-dump.json
//!
//! # Remove a subtree and all custom policies
//! vault-walker purge secret/old,sys/policy --force
//! ```

pub mod config;
pub mod error;
pub mod output;
pub mod path;
pub mod progress;
pub mod vault;
pub mod walker;

pub use config::{CliArgs, RunConfig};
pub use error::{Result, RunError, VaultError};
pub use vault::{HttpVault, MemoryVault, SecretData, VaultStore};
pub use walker::{DumpCoordinator, LoadCoordinator, PurgeCoordinator};
