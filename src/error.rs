//! Error types for vault-walker
//!
//! This module defines the error hierarchy that covers:
//! - Remote store errors (HTTP transport, Vault status codes)
//! - Configuration and CLI errors
//! - Worker thread errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Errors should be actionable - include the path that failed
//! - Per-leaf errors are values, not panics; only configuration and
//!   root discovery errors abort a run

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a dump, import or purge run
#[derive(Error, Debug)]
pub enum RunError {
    /// Remote store errors
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors (output files, input bundles)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of the aggregated output failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A root path could neither be listed nor read
    #[error("Unable to discover root '{path}': {reason}")]
    RootDiscovery { path: String, reason: String },
}

/// Remote store errors
#[derive(Error, Debug, Clone)]
pub enum VaultError {
    /// Transport-level failure (connect, TLS, timeout)
    #[error("request to '{path}' failed: {reason}")]
    Http { path: String, reason: String },

    /// Vault answered with a non-success status
    #[error("{method} {path} returned {status}: {message}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        message: String,
    },

    /// Response body was not the expected JSON shape
    #[error("unexpected response from '{path}': {reason}")]
    Decode { path: String, reason: String },

    /// Address could not be used to build a request URL
    #[error("invalid Vault address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Failure raised by the in-memory store
    #[error("{operation} '{path}': {message}")]
    Injected {
        operation: &'static str,
        path: String,
        message: String,
    },
}

impl VaultError {
    /// Vault refused the request on ACL grounds
    pub fn is_denied(&self) -> bool {
        matches!(self, VaultError::Status { status: 403, .. })
    }

    /// Check if the failure may clear on its own
    ///
    /// Transport errors, rate limits and sealed or standby nodes are
    /// transient. Client errors and malformed answers are not.
    pub fn is_transient(&self) -> bool {
        match self {
            VaultError::Http { .. } | VaultError::Injected { .. } => true,
            VaultError::Status { status, .. } => *status == 429 || *status >= 500,
            VaultError::Decode { .. } | VaultError::InvalidAddress { .. } => false,
        }
    }
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Vault address missing or malformed
    #[error("Invalid Vault address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// No token supplied
    #[error("Vault token is required (--vault-token or VAULT_TOKEN)")]
    MissingToken,

    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid queue size
    #[error("Invalid queue size {size}: must be at least {min}")]
    InvalidQueueSize { size: usize, min: usize },

    /// No usable path was given
    #[error("At least one Vault path is required")]
    NoPaths,

    /// Output path error
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutputPath { path: PathBuf, reason: String },

    /// Input bundle missing or unreadable
    #[error("Invalid input file '{path}': {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    /// A flag was supplied to a subcommand that does not honor it
    #[error("--{flag} is not valid for the {command} command")]
    UnsupportedFlag {
        flag: &'static str,
        command: &'static str,
    },
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker {name} panicked")]
    Panicked { name: String },

    /// Thread could not be spawned
    #[error("Failed to spawn {name}: {reason}")]
    SpawnFailed { name: String, reason: String },
}

/// Result type alias for RunError
pub type Result<T> = std::result::Result<T, RunError>;

/// Result type alias for VaultError
pub type VaultResult<T> = std::result::Result<T, VaultError>;

/// Outcome of processing a single leaf or purge task
#[derive(Debug)]
pub enum LeafOutcome {
    /// Remote call succeeded
    Done { path: String },

    /// Nothing to do (read miss, protected policy, cancelled)
    Skipped { path: String, reason: String },

    /// Failed after retries
    Failed { path: String, error: VaultError },
}
