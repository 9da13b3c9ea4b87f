//! Dump coordinator
//!
//! Pipelines discovery, leaf reads and aggregation:
//!
//! ```text
//! ┌──────────────┐   leaf queue   ┌─────────────┐  record queue  ┌────────────┐
//! │  Discoverer  │ ─────────────▶ │ N readers   │ ─────────────▶ │ Aggregator │
//! │  (M threads) │   (bounded)    │ (READ leaf) │   (bounded)    │ (BTreeMap) │
//! └──────────────┘                └─────────────┘                └────────────┘
//! ```
//!
//! The aggregator is the only owner of the output map. Once shutdown is
//! requested, discovery stops and readers drain the leaf queue without
//! touching Vault, so every thread exits and no fetched record is lost.

use crate::config::IgnoreRules;
use crate::error::{Result, WorkerError};
use crate::vault::{ProtocolResolver, SecretData, VaultStore};
use crate::walker::discover::{DiscoveredLeaf, Discoverer};
use crate::walker::queue::{RecvOutcome, WorkQueue, WorkQueueReceiver, WorkQueueSender};
use crate::walker::stats::{RunProgress, RunStats};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A leaf read from Vault, on its way to the aggregator
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub path: String,
    pub data: SecretData,
}

/// Dump parameters
#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub roots: Vec<String>,
    pub workers: usize,
    pub discovery_threads: usize,
    pub queue_size: usize,
    pub ignore: IgnoreRules,
}

impl DumpOptions {
    pub fn new(roots: Vec<String>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            roots,
            workers,
            discovery_threads: (workers / 2).max(1),
            queue_size: 1000,
            ignore: IgnoreRules::default(),
        }
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }

    pub fn with_ignore(mut self, ignore: IgnoreRules) -> Self {
        self.ignore = ignore;
        self
    }
}

/// Result of a dump run
#[derive(Debug)]
pub struct DumpResult {
    /// Read-form path -> secret
    pub secrets: BTreeMap<String, SecretData>,
    pub progress: RunProgress,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    /// False if the run was interrupted
    pub completed: bool,
}

/// Runs one dump
pub struct DumpCoordinator {
    store: Arc<dyn VaultStore>,
    resolver: Arc<ProtocolResolver>,
    options: DumpOptions,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunStats>,
}

impl DumpCoordinator {
    pub fn new(store: Arc<dyn VaultStore>, options: DumpOptions) -> Self {
        let resolver = Arc::new(ProtocolResolver::new(Arc::clone(&store)));
        Self::with_resolver(store, resolver, options)
    }

    /// Share a resolver (and its memo) with other runs in the session
    pub fn with_resolver(
        store: Arc<dyn VaultStore>,
        resolver: Arc<ProtocolResolver>,
        options: DumpOptions,
    ) -> Self {
        Self {
            store,
            resolver,
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RunStats::new()),
        }
    }

    /// Get the shutdown flag for signal handling
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Request cancellation
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> Arc<RunStats> {
        Arc::clone(&self.stats)
    }

    /// Run the dump to completion (or cancellation)
    pub fn run(&self) -> Result<DumpResult> {
        self.run_inner(|_| {})
    }

    /// Run the dump, calling `progress_callback` every 100ms
    pub fn run_with_progress<F>(&self, progress_callback: F) -> Result<DumpResult>
    where
        F: Fn(RunProgress) + Send + 'static,
    {
        self.run_inner(progress_callback)
    }

    fn run_inner<F>(&self, progress_callback: F) -> Result<DumpResult>
    where
        F: Fn(RunProgress) + Send + 'static,
    {
        let start = Instant::now();
        let started_at = Utc::now();
        let opts = &self.options;

        info!(
            roots = ?opts.roots,
            workers = opts.workers,
            discovery = opts.discovery_threads,
            "Starting dump"
        );

        let leaf_queue = WorkQueue::<DiscoveredLeaf>::new(opts.queue_size);
        let leaf_stats = leaf_queue.stats();
        let (leaf_tx, leaf_rx) = leaf_queue.split();
        let (record_tx, record_rx) = WorkQueue::<SecretRecord>::new(opts.queue_size).split();

        let aggregator = spawn_aggregator(record_rx, Arc::clone(&self.stats))?;

        let discoverer = Discoverer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.resolver),
            Arc::new(opts.ignore.clone()),
            Arc::clone(&self.shutdown),
            Arc::clone(&self.stats),
        );
        let discovery = discoverer.spawn(&opts.roots, leaf_tx, opts.discovery_threads);

        let mut readers = Vec::with_capacity(opts.workers);
        let mut spawn_error = None;
        if discovery.is_ok() {
            for id in 0..opts.workers {
                match self.spawn_reader(id, leaf_rx.clone(), record_tx.clone()) {
                    Ok(handle) => readers.push(handle),
                    Err(e) => {
                        self.shutdown();
                        spawn_error = Some(e);
                        break;
                    }
                }
            }
        }

        // only reader clones keep the queues open from here on
        drop(record_tx);

        let done = Arc::new(AtomicBool::new(false));
        let ticker = {
            let done = Arc::clone(&done);
            let stats = Arc::clone(&self.stats);
            let leaf_rx = leaf_rx.clone();
            let workers = opts.workers;
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    progress_callback(stats.snapshot(leaf_rx.len(), workers, start.elapsed()));
                    thread::sleep(Duration::from_millis(100));
                }
            })
        };
        if readers.is_empty() {
            // nobody will drain the leaf queue; let blocked discovery exit
            self.shutdown();
        }
        drop(leaf_rx);

        let discovery_result = discovery.and_then(|handle| handle.join());

        let mut reader_error = None;
        for (name, handle) in readers {
            if handle.join().is_err() {
                reader_error.get_or_insert(WorkerError::Panicked { name });
            }
        }

        let secrets = aggregator.join().map_err(|_| WorkerError::Panicked {
            name: "aggregator".to_string(),
        })?;

        done.store(true, Ordering::Relaxed);
        let _ = ticker.join();

        discovery_result?;
        if let Some(e) = spawn_error {
            return Err(e);
        }
        if let Some(e) = reader_error {
            return Err(e.into());
        }

        let completed = !self.shutdown.load(Ordering::Relaxed);
        let progress = self.stats.snapshot(0, opts.workers, start.elapsed());
        info!(
            secrets = secrets.len(),
            failed = progress.failed,
            leaf_backpressure = leaf_stats.backpressure_count(),
            completed,
            "Dump finished"
        );

        Ok(DumpResult {
            secrets,
            progress,
            duration: start.elapsed(),
            started_at,
            completed,
        })
    }

    fn spawn_reader(
        &self,
        id: usize,
        leaves: WorkQueueReceiver<DiscoveredLeaf>,
        records: WorkQueueSender<SecretRecord>,
    ) -> Result<(String, JoinHandle<()>)> {
        let name = format!("reader-{id}");
        let store = Arc::clone(&self.store);
        let shutdown = Arc::clone(&self.shutdown);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || reader_loop(id, store.as_ref(), &leaves, &records, &shutdown, &stats))
            .map_err(|e| WorkerError::SpawnFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        Ok((name, handle))
    }
}

fn reader_loop(
    id: usize,
    store: &dyn VaultStore,
    leaves: &WorkQueueReceiver<DiscoveredLeaf>,
    records: &WorkQueueSender<SecretRecord>,
    shutdown: &AtomicBool,
    stats: &RunStats,
) {
    debug!(worker = id, "Reader started");

    loop {
        let leaf = match leaves.recv_polling() {
            RecvOutcome::Item(leaf) => leaf,
            RecvOutcome::Idle => continue,
            RecvOutcome::Closed => break,
        };

        // drain without remote I/O once cancelled
        if shutdown.load(Ordering::Relaxed) {
            stats.inc_skipped();
            continue;
        }

        match store.read(&leaf.path) {
            Ok(Some(data)) => {
                let record = SecretRecord {
                    path: leaf.path,
                    data: data.unwrap_v2(),
                };
                records.send(record);
            }
            Ok(None) => {
                debug!(worker = id, path = %leaf.path, "Nothing to read");
                stats.inc_skipped();
            }
            Err(e) if e.is_denied() => {
                debug!(worker = id, path = %leaf.path, "Read denied, skipping");
                stats.inc_skipped();
            }
            Err(e) => {
                warn!(worker = id, path = %leaf.path, error = %e, "Read failed");
                stats.inc_failed();
            }
        }
    }

    debug!(worker = id, "Reader finished");
}

fn spawn_aggregator(
    records: WorkQueueReceiver<SecretRecord>,
    stats: Arc<RunStats>,
) -> Result<JoinHandle<BTreeMap<String, SecretData>>> {
    let handle = thread::Builder::new()
        .name("aggregator".to_string())
        .spawn(move || {
            let mut secrets = BTreeMap::new();
            while let Some(record) = records.recv() {
                secrets.insert(record.path, record.data);
                stats.inc_processed();
            }
            secrets
        })
        .map_err(|e| WorkerError::SpawnFailed {
            name: "aggregator".to_string(),
            reason: e.to_string(),
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{MemoryVault, MountProtocol};
    use crate::vault::memory::Op;

    fn vault() -> Arc<MemoryVault> {
        let vault = Arc::new(MemoryVault::new());
        vault.mount("secret", MountProtocol::V1);
        vault.mount("kv", MountProtocol::V2);
        vault
    }

    #[test]
    fn test_dump_v1_and_v2() {
        let vault = vault();
        vault.seed("secret/a/b/x", SecretData::new().with("x", "1"));
        vault.seed("secret/a/c", SecretData::new().with("c", "2"));
        vault.seed("kv/team/db", SecretData::new().with("pw", "3"));

        let coordinator = DumpCoordinator::new(
            vault.clone(),
            DumpOptions::new(vec!["secret/a".into(), "kv/team".into()], 4).with_queue_size(2),
        );
        let result = coordinator.run().unwrap();

        assert!(result.completed);
        let keys: Vec<&str> = result.secrets.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["kv/data/team/db", "secret/a/b/x", "secret/a/c"]);
        assert_eq!(result.secrets["kv/data/team/db"], SecretData::new().with("pw", "3"));
        assert_eq!(result.progress.processed, 3);
    }

    #[test]
    fn test_read_failure_is_counted() {
        let vault = vault();
        vault.seed("secret/a/x", SecretData::new().with("k", "v"));
        vault.seed("secret/a/y", SecretData::new().with("k", "v"));
        vault.fail(Op::Read, "secret/a/y", 1);

        let coordinator = DumpCoordinator::new(vault.clone(), DumpOptions::new(vec!["secret/a".into()], 2));
        let result = coordinator.run().unwrap();

        assert_eq!(result.secrets.len(), 1);
        assert_eq!(result.progress.failed, 1);
    }

    #[test]
    fn test_denied_read_is_skipped() {
        let vault = vault();
        vault.seed("secret/a/open", SecretData::new().with("k", "v"));
        vault.seed("secret/a/denied", SecretData::new().with("k", "v"));
        vault.deny(Op::Read, "secret/a/denied");

        let coordinator = DumpCoordinator::new(vault.clone(), DumpOptions::new(vec!["secret/a".into()], 2));
        let result = coordinator.run().unwrap();

        assert!(result.completed);
        assert_eq!(result.secrets.len(), 1);
        assert_eq!(result.progress.failed, 0);
        assert_eq!(result.progress.skipped, 1);
    }

    #[test]
    fn test_empty_tree() {
        let vault = vault();
        let coordinator = DumpCoordinator::new(vault.clone(), DumpOptions::new(vec!["secret/none".into()], 2));
        let result = coordinator.run().unwrap();
        assert!(result.secrets.is_empty());
        assert!(result.completed);
    }

    #[test]
    fn test_cancelled_before_start() {
        let vault = vault();
        vault.seed("secret/a/x", SecretData::new().with("k", "v"));

        let coordinator = DumpCoordinator::new(vault.clone(), DumpOptions::new(vec!["secret/a".into()], 2));
        coordinator.shutdown();
        let result = coordinator.run().unwrap();

        assert!(!result.completed);
        assert!(vault.calls_of(Op::Read).is_empty());
    }
}
