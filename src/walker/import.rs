//! Import coordinator
//!
//! Writes a dumped `path -> secret` map back to Vault.
//!
//! ```text
//! ┌──────────┐  entry queue  ┌──────────────┐  failure queue  ┌────────────┐
//! │ Producer │ ────────────▶ │ N writers    │ ──────────────▶ │ Aggregator │
//! │ (ignore) │   (bounded)   │ (retry loop) │    (bounded)    │ (tally)    │
//! └──────────┘               └──────────────┘                 └────────────┘
//! ```
//!
//! Writers route each entry by path:
//! - `sys/policy/<name>`: written as an ACL policy; built-ins are skipped
//! - `database/config/<name>`: written as-is, no KV version handling
//! - anything else: KV write, rewritten for the mount's protocol
//!
//! Entries that still fail after retries go to the aggregator, which owns
//! the [`ErrorTally`] for the run.

use crate::config::IgnoreRules;
use crate::error::{LeafOutcome, Result, RunError, VaultError, WorkerError};
use crate::path;
use crate::vault::{self, ProtocolResolver, SecretData, VaultStore};
use crate::walker::queue::{RecvOutcome, SendOutcome, WorkQueue, WorkQueueReceiver, WorkQueueSender};
use crate::walker::retry::{with_retry, RetryPolicy};
use crate::walker::stats::{RunProgress, RunStats};
use crate::walker::tally::ErrorTally;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One entry of a dump, on its way to a writer
#[derive(Debug, Clone)]
pub struct ImportEntry {
    pub path: String,
    pub secret: SecretData,
}

/// An entry that could not be written
#[derive(Debug)]
struct FailedEntry {
    entry: ImportEntry,
    error: VaultError,
}

/// Import parameters
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub workers: usize,
    pub queue_size: usize,
    pub retry: RetryPolicy,
    pub ignore: IgnoreRules,
}

impl ImportOptions {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            queue_size: 1000,
            retry: RetryPolicy::default(),
            ignore: IgnoreRules::default(),
        }
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ignore(mut self, ignore: IgnoreRules) -> Self {
        self.ignore = ignore;
        self
    }
}

/// Result of an import run
#[derive(Debug)]
pub struct ImportResult {
    pub tally: ErrorTally,
    pub progress: RunProgress,
    pub duration: Duration,
    /// False if the run was interrupted
    pub completed: bool,
}

impl ImportResult {
    /// True when every non-ignored entry was written or skipped on purpose
    pub fn is_clean(&self) -> bool {
        self.completed && self.tally.is_empty()
    }
}

/// Read a dump file into a `path -> secret` map
pub fn load_bundle(path: &Path) -> Result<BTreeMap<String, SecretData>> {
    let body = fs::read_to_string(path)?;
    let bundle = serde_json::from_str(&body)?;
    Ok(bundle)
}

/// Runs one import
pub struct LoadCoordinator {
    store: Arc<dyn VaultStore>,
    resolver: Arc<ProtocolResolver>,
    options: ImportOptions,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunStats>,
}

impl LoadCoordinator {
    pub fn new(store: Arc<dyn VaultStore>, options: ImportOptions) -> Self {
        let resolver = Arc::new(ProtocolResolver::new(Arc::clone(&store)));
        Self::with_resolver(store, resolver, options)
    }

    pub fn with_resolver(
        store: Arc<dyn VaultStore>,
        resolver: Arc<ProtocolResolver>,
        options: ImportOptions,
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

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> Arc<RunStats> {
        Arc::clone(&self.stats)
    }

    pub fn run(&self, bundle: BTreeMap<String, SecretData>) -> Result<ImportResult> {
        self.run_inner(bundle, |_| {})
    }

    /// Run the import, calling `progress_callback` every 100ms
    pub fn run_with_progress<F>(&self, bundle: BTreeMap<String, SecretData>, progress_callback: F) -> Result<ImportResult>
    where
        F: Fn(RunProgress) + Send + 'static,
    {
        self.run_inner(bundle, progress_callback)
    }

    fn run_inner<F>(&self, bundle: BTreeMap<String, SecretData>, progress_callback: F) -> Result<ImportResult>
    where
        F: Fn(RunProgress) + Send + 'static,
    {
        let start = Instant::now();
        let opts = &self.options;

        info!(
            entries = bundle.len(),
            workers = opts.workers,
            retries = opts.retry.max_attempts,
            "Starting import"
        );

        let (entry_tx, entry_rx) = WorkQueue::<ImportEntry>::new(opts.queue_size).split();
        let (failure_tx, failure_rx) = WorkQueue::<FailedEntry>::new(opts.queue_size).split();

        let aggregator = spawn_named("aggregator", {
            let stats = Arc::clone(&self.stats);
            move || aggregate(&failure_rx, &stats)
        })?;

        let mut writers = Vec::with_capacity(opts.workers);
        let mut spawn_error: Option<RunError> = None;
        for id in 0..opts.workers {
            let ctx = self.writer_context();
            let entries = entry_rx.clone();
            let failures = failure_tx.clone();
            match spawn_named(&format!("writer-{id}"), move || writer_loop(id, &ctx, &entries, &failures)) {
                Ok(handle) => writers.push(handle),
                Err(e) => {
                    self.shutdown();
                    spawn_error = Some(e);
                    break;
                }
            }
        }
        drop(failure_tx);

        let queue_view = entry_rx.clone();
        drop(entry_rx);
        if writers.is_empty() {
            self.shutdown();
        }

        let producer = spawn_named("producer", {
            let shutdown = Arc::clone(&self.shutdown);
            let stats = Arc::clone(&self.stats);
            let ignore = opts.ignore.clone();
            move || produce(bundle, &ignore, &entry_tx, &shutdown, &stats)
        });

        let done = Arc::new(AtomicBool::new(false));
        let ticker = {
            let done = Arc::clone(&done);
            let stats = Arc::clone(&self.stats);
            let workers = opts.workers;
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    progress_callback(stats.snapshot(queue_view.len(), workers, start.elapsed()));
                    thread::sleep(Duration::from_millis(100));
                }
            })
        };

        let mut join_error: Option<RunError> = None;
        match producer {
            Ok((name, handle)) => {
                if handle.join().is_err() {
                    join_error.get_or_insert(WorkerError::Panicked { name }.into());
                }
            }
            Err(e) => {
                self.shutdown();
                join_error.get_or_insert(e);
            }
        }
        for (name, handle) in writers {
            if handle.join().is_err() {
                join_error.get_or_insert(WorkerError::Panicked { name }.into());
            }
        }
        let (name, handle) = aggregator;
        let tally = handle
            .join()
            .map_err(|_| RunError::from(WorkerError::Panicked { name }))?;

        done.store(true, Ordering::Relaxed);
        let _ = ticker.join();

        if let Some(e) = spawn_error.or(join_error) {
            return Err(e);
        }

        let completed = !self.shutdown.load(Ordering::Relaxed);
        let progress = self.stats.snapshot(0, opts.workers, start.elapsed());
        info!(
            written = progress.processed,
            failed = tally.len(),
            skipped = progress.skipped,
            ignored = progress.ignored,
            completed,
            "Import finished"
        );

        Ok(ImportResult {
            tally,
            progress,
            duration: start.elapsed(),
            completed,
        })
    }

    fn writer_context(&self) -> WriterContext {
        WriterContext {
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            retry: self.options.retry,
            shutdown: Arc::clone(&self.shutdown),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Spawn a named thread, mapping spawn failures into `WorkerError`
fn spawn_named<T, F>(name: &str, f: F) -> Result<(String, JoinHandle<T>)>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|handle| (name.to_string(), handle))
        .map_err(|e| {
            WorkerError::SpawnFailed {
                name: name.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
}

/// Feed the bundle into the entry queue, dropping ignored paths
fn produce(
    bundle: BTreeMap<String, SecretData>,
    ignore: &IgnoreRules,
    entries: &WorkQueueSender<ImportEntry>,
    shutdown: &AtomicBool,
    stats: &RunStats,
) {
    for (raw_path, secret) in bundle {
        let path = path::sanitize(&raw_path);
        if path.is_empty() {
            continue;
        }
        if ignore.matches(&path) {
            debug!(path = %path, "Ignoring entry");
            stats.inc_ignored();
            continue;
        }

        match entries.send_polling(ImportEntry { path, secret }, shutdown) {
            SendOutcome::Sent => stats.add_found(1),
            SendOutcome::Cancelled | SendOutcome::Closed => {
                debug!("Producer stopping early");
                break;
            }
        }
    }
}

/// Everything a writer thread needs
struct WriterContext {
    store: Arc<dyn VaultStore>,
    resolver: Arc<ProtocolResolver>,
    retry: RetryPolicy,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunStats>,
}

impl WriterContext {
    /// Write one entry, retrying per the policy
    fn import(&self, entry: &ImportEntry) -> LeafOutcome {
        let path = entry.path.clone();
        let store = self.store.as_ref();

        let result = if let Some(name) = vault::policy_name(&path) {
            if vault::is_protected_policy(name) {
                return LeafOutcome::Skipped {
                    path,
                    reason: "built-in policy".into(),
                };
            }
            let Some(policy) = entry.secret.as_policy_definition() else {
                return LeafOutcome::Failed {
                    error: VaultError::Decode {
                        path: path.clone(),
                        reason: "policy entry has neither 'rules' nor 'policy'".into(),
                    },
                    path,
                };
            };
            with_retry(&self.retry, &self.shutdown, |_| store.put_policy(name, &policy.rules))
        } else if vault::is_database_config(&path) {
            let payload = entry.secret.as_database_config();
            with_retry(&self.retry, &self.shutdown, |_| store.write(&path, &payload))
        } else {
            with_retry(&self.retry, &self.shutdown, |_| {
                let (target, payload) = self.resolver.prepare_write(&path, entry.secret.clone())?;
                store.write(&target, &payload)
            })
        };

        match result {
            Ok(()) => LeafOutcome::Done { path },
            Err(error) => LeafOutcome::Failed { path, error },
        }
    }
}

fn writer_loop(
    id: usize,
    ctx: &WriterContext,
    entries: &WorkQueueReceiver<ImportEntry>,
    failures: &WorkQueueSender<FailedEntry>,
) {
    debug!(worker = id, "Writer started");

    loop {
        let entry = match entries.recv_polling() {
            RecvOutcome::Item(entry) => entry,
            RecvOutcome::Idle => continue,
            RecvOutcome::Closed => break,
        };

        // drain without remote I/O once cancelled
        if ctx.shutdown.load(Ordering::Relaxed) {
            ctx.stats.inc_skipped();
            continue;
        }

        match ctx.import(&entry) {
            LeafOutcome::Done { path } => {
                debug!(worker = id, path = %path, "Written");
                ctx.stats.inc_processed();
            }
            LeafOutcome::Skipped { path, reason } => {
                debug!(worker = id, path = %path, reason = %reason, "Skipped");
                ctx.stats.inc_skipped();
            }
            LeafOutcome::Failed { path, error } => {
                warn!(worker = id, path = %path, error = %error, "Write failed");
                failures.send(FailedEntry { entry, error });
            }
        }
    }

    debug!(worker = id, "Writer finished");
}

/// Single owner of the tally
fn aggregate(failures: &WorkQueueReceiver<FailedEntry>, stats: &RunStats) -> ErrorTally {
    let mut tally = ErrorTally::new();
    while let Some(failed) = failures.recv() {
        stats.inc_failed();
        tally.record(&failed.entry.path, failed.entry.secret, &failed.error.to_string());
    }
    tally
}
