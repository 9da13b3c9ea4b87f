//! Recursive purge
//!
//! Deletes whole subtrees of secrets and every non-built-in policy.
//!
//! ```text
//! Task injector (crossbeam deque) + pending counter
//! │
//! ├── Worker 0: steal task → LIST children → push children → DELETE self
//! ├── Worker 1: ...
//! └── Worker N: ...
//! ```
//!
//! A secret task lists its own children before deleting itself, so the
//! listing still sees them. Children are registered on the pending
//! counter before the parent retires; the pool is done when the counter
//! reaches zero.

use crate::error::{LeafOutcome, Result, VaultError, WorkerError};
use crate::path;
use crate::vault::{self, ProtocolResolver, VaultStore};
use crate::walker::queue::{steal, PendingWork};
use crate::walker::retry::{with_retry, RetryPolicy};
use crate::walker::stats::{RunProgress, RunStats};
use crossbeam_deque::Injector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pause between empty steals while other workers may still push tasks
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// What a purge task deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeKind {
    /// A secret path and everything below it
    Secret,
    /// A single policy, addressed by name
    Policy,
    /// `sys/policy`: fans out to every policy
    PolicyRoot,
}

/// Unit of purge work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeTask {
    /// Logical path for secrets, policy name for policies
    pub path: String,
    pub kind: PurgeKind,
}

impl PurgeTask {
    /// Classify a user-supplied root
    pub fn seed(root: &str) -> Self {
        let root = path::sanitize(root);
        if root == vault::POLICY_ROOT {
            return Self {
                path: root,
                kind: PurgeKind::PolicyRoot,
            };
        }
        if let Some(name) = vault::policy_name(&root) {
            return Self {
                path: name.to_string(),
                kind: PurgeKind::Policy,
            };
        }
        Self {
            path: root,
            kind: PurgeKind::Secret,
        }
    }
}

/// Purge parameters
#[derive(Debug, Clone)]
pub struct PurgeOptions {
    pub roots: Vec<String>,
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl PurgeOptions {
    pub fn new(roots: Vec<String>, workers: usize) -> Self {
        Self {
            roots,
            workers: workers.max(1),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Result of a purge run
#[derive(Debug)]
pub struct PurgeResult {
    /// Paths (or policy names) that could not be deleted
    pub failures: Vec<(String, VaultError)>,
    pub progress: RunProgress,
    pub duration: Duration,
    pub completed: bool,
}

impl PurgeResult {
    pub fn is_clean(&self) -> bool {
        self.completed && self.failures.is_empty()
    }
}

/// State shared by purge workers
struct Shared {
    store: Arc<dyn VaultStore>,
    resolver: Arc<ProtocolResolver>,
    retry: RetryPolicy,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunStats>,
    injector: Injector<PurgeTask>,
    pending: PendingWork,
}

/// Runs one purge
pub struct PurgeCoordinator {
    store: Arc<dyn VaultStore>,
    resolver: Arc<ProtocolResolver>,
    options: PurgeOptions,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunStats>,
}

impl PurgeCoordinator {
    pub fn new(store: Arc<dyn VaultStore>, options: PurgeOptions) -> Self {
        let resolver = Arc::new(ProtocolResolver::new(Arc::clone(&store)));
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

    pub fn run(&self) -> Result<PurgeResult> {
        self.run_inner(|_| {})
    }

    /// Run the purge, calling `progress_callback` every 100ms
    pub fn run_with_progress<F>(&self, progress_callback: F) -> Result<PurgeResult>
    where
        F: Fn(RunProgress) + Send + 'static,
    {
        self.run_inner(progress_callback)
    }

    fn run_inner<F>(&self, progress_callback: F) -> Result<PurgeResult>
    where
        F: Fn(RunProgress) + Send + 'static,
    {
        let start = Instant::now();
        let opts = &self.options;
        info!(roots = ?opts.roots, workers = opts.workers, "Starting purge");

        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            retry: opts.retry,
            shutdown: Arc::clone(&self.shutdown),
            stats: Arc::clone(&self.stats),
            injector: Injector::new(),
            pending: PendingWork::new(0),
        });

        for root in &opts.roots {
            let task = PurgeTask::seed(root);
            debug!(path = %task.path, kind = ?task.kind, "Seeding purge task");
            shared.pending.add(1);
            shared.stats.add_found(1);
            shared.injector.push(task);
        }

        let mut workers = Vec::with_capacity(opts.workers);
        let mut spawn_error = None;
        for id in 0..opts.workers {
            let name = format!("purge-{id}");
            let shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || purge_loop(id, &shared))
            {
                Ok(handle) => workers.push((name, handle)),
                Err(e) => {
                    self.shutdown();
                    spawn_error = Some(WorkerError::SpawnFailed {
                        name,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        let done = Arc::new(AtomicBool::new(false));
        let ticker = {
            let done = Arc::clone(&done);
            let shared = Arc::clone(&shared);
            let total = opts.workers;
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    let queued = shared.injector.len();
                    progress_callback(shared.stats.snapshot(queued, total, start.elapsed()));
                    thread::sleep(Duration::from_millis(100));
                }
            })
        };

        let (failures, panicked) = join_workers(workers);
        done.store(true, Ordering::Relaxed);
        let _ = ticker.join();

        if let Some(e) = spawn_error.or(panicked) {
            return Err(e.into());
        }

        let completed = !self.shutdown.load(Ordering::Relaxed);
        let progress = self.stats.snapshot(0, opts.workers, start.elapsed());
        info!(
            deleted = progress.processed,
            failed = failures.len(),
            skipped = progress.skipped,
            completed,
            "Purge finished"
        );

        Ok(PurgeResult {
            failures,
            progress,
            duration: start.elapsed(),
            completed,
        })
    }
}

type WorkerHandle = (String, JoinHandle<Vec<(String, VaultError)>>);

fn join_workers(workers: Vec<WorkerHandle>) -> (Vec<(String, VaultError)>, Option<WorkerError>) {
    let mut failures = Vec::new();
    let mut panicked = None;
    for (name, handle) in workers {
        match handle.join() {
            Ok(mut f) => failures.append(&mut f),
            Err(_) => {
                panicked.get_or_insert(WorkerError::Panicked { name });
            }
        }
    }
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    (failures, panicked)
}

fn purge_loop(id: usize, shared: &Shared) -> Vec<(String, VaultError)> {
    debug!(worker = id, "Purge worker started");
    let mut failures = Vec::new();

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let Some(task) = steal(&shared.injector) else {
            if shared.pending.is_done() {
                break;
            }
            thread::sleep(IDLE_BACKOFF);
            continue;
        };

        let _guard = shared.pending.guard();
        match shared.process(&task) {
            LeafOutcome::Done { path } => {
                debug!(worker = id, path = %path, "Deleted");
                shared.stats.inc_processed();
            }
            LeafOutcome::Skipped { path, reason } => {
                debug!(worker = id, path = %path, reason = %reason, "Skipped");
                shared.stats.inc_skipped();
            }
            LeafOutcome::Failed { path, error } => {
                warn!(worker = id, path = %path, error = %error, "Delete failed");
                shared.stats.inc_failed();
                failures.push((path, error));
            }
        }
    }

    debug!(worker = id, "Purge worker finished");
    failures
}

impl Shared {
    fn process(&self, task: &PurgeTask) -> LeafOutcome {
        match task.kind {
            PurgeKind::PolicyRoot => self.expand_policies(task),
            PurgeKind::Policy => self.delete_policy(task),
            PurgeKind::Secret => self.delete_secret(task),
        }
    }

    fn enqueue(&self, tasks: Vec<PurgeTask>) -> bool {
        // a cancelled run stops growing
        if self.shutdown.load(Ordering::Relaxed) {
            return false;
        }
        self.pending.add(tasks.len() as u64);
        self.stats.add_found(tasks.len() as u64);
        for task in tasks {
            self.injector.push(task);
        }
        true
    }

    fn expand_policies(&self, task: &PurgeTask) -> LeafOutcome {
        let names = match with_retry(&self.retry, &self.shutdown, |_| self.store.list_policies()) {
            Ok(names) => names,
            Err(error) => {
                return LeafOutcome::Failed {
                    path: task.path.clone(),
                    error,
                }
            }
        };

        let tasks = names
            .into_iter()
            .map(|name| PurgeTask {
                path: name,
                kind: PurgeKind::Policy,
            })
            .collect();

        if self.enqueue(tasks) {
            LeafOutcome::Skipped {
                path: task.path.clone(),
                reason: "expanded".into(),
            }
        } else {
            LeafOutcome::Skipped {
                path: task.path.clone(),
                reason: "cancelled".into(),
            }
        }
    }

    fn delete_policy(&self, task: &PurgeTask) -> LeafOutcome {
        let name = task.path.as_str();
        if vault::is_protected_policy(name) {
            return LeafOutcome::Skipped {
                path: name.to_string(),
                reason: "built-in policy".into(),
            };
        }
        match with_retry(&self.retry, &self.shutdown, |_| self.store.delete_policy(name)) {
            Ok(()) => LeafOutcome::Done {
                path: format!("{}/{name}", vault::POLICY_ROOT),
            },
            Err(error) => LeafOutcome::Failed {
                path: format!("{}/{name}", vault::POLICY_ROOT),
                error,
            },
        }
    }

    /// Request path for a logical secret path on its mount
    ///
    /// v2 mounts are listed and deleted through `metadata`, which removes
    /// every version.
    fn request_path(&self, logical: &str) -> String {
        match self.resolver.resolve(logical) {
            Ok(info) => info.list_form(logical),
            Err(e) => {
                debug!(path = %logical, error = %e, "Mount lookup failed, using path as-is");
                logical.to_string()
            }
        }
    }

    fn delete_secret(&self, task: &PurgeTask) -> LeafOutcome {
        let request = self.request_path(&task.path);

        let children = match self.store.list(&request) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %request, error = %e, "List failed, deleting as leaf");
                Vec::new()
            }
        };

        let tasks: Vec<PurgeTask> = children
            .iter()
            .map(|entry| PurgeTask {
                path: path::join(&task.path, &entry.name),
                kind: PurgeKind::Secret,
            })
            .collect();
        if !self.enqueue(tasks) {
            return LeafOutcome::Skipped {
                path: task.path.clone(),
                reason: "cancelled".into(),
            };
        }

        match with_retry(&self.retry, &self.shutdown, |_| self.store.delete(&request)) {
            Ok(()) => LeafOutcome::Done { path: request },
            Err(error) => LeafOutcome::Failed { path: request, error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::memory::Op;
    use crate::vault::{MemoryVault, MountProtocol, SecretData};

    fn vault() -> Arc<MemoryVault> {
        let vault = Arc::new(MemoryVault::new());
        vault.mount("secret", MountProtocol::V1);
        vault.mount("kv", MountProtocol::V2);
        vault
    }

    fn fast(roots: &[&str], workers: usize) -> PurgeOptions {
        PurgeOptions::new(roots.iter().map(|r| r.to_string()).collect(), workers)
            .with_retry(RetryPolicy::new(1).with_jitter_ceiling(Duration::ZERO))
    }

    #[test]
    fn test_seed_classification() {
        assert_eq!(PurgeTask::seed("/sys/policy/").kind, PurgeKind::PolicyRoot);
        let task = PurgeTask::seed("sys/policy/ops");
        assert_eq!(task.kind, PurgeKind::Policy);
        assert_eq!(task.path, "ops");
        assert_eq!(PurgeTask::seed("secret/a").kind, PurgeKind::Secret);
    }

    #[test]
    fn test_purge_subtree() {
        let vault = vault();
        for p in ["secret/a/b", "secret/a/c/d", "secret/keep"] {
            vault.seed(p, SecretData::new().with("k", "v"));
        }

        let result = PurgeCoordinator::new(vault.clone(), fast(&["secret/a"], 4)).run().unwrap();

        assert!(result.is_clean());
        assert_eq!(vault.paths(), vec!["secret/keep"]);
        let deleted = vault.calls_of(Op::Delete);
        for p in ["secret/a", "secret/a/b", "secret/a/c", "secret/a/c/d"] {
            assert!(deleted.contains(&p.to_string()), "missing delete of {p}");
        }
    }

    #[test]
    fn test_purge_v2_uses_metadata() {
        let vault = vault();
        vault.seed("kv/app/x", SecretData::new().with("k", "v"));

        let result = PurgeCoordinator::new(vault.clone(), fast(&["kv/app"], 2)).run().unwrap();

        assert!(result.is_clean());
        assert!(vault.paths().is_empty());
        assert!(vault.calls_of(Op::Delete).contains(&"kv/metadata/app/x".to_string()));
    }

    #[test]
    fn test_purge_policies_keeps_builtins() {
        let vault = vault();
        vault.seed_policy("ops", "path \"*\" {}");
        vault.seed_policy("dev", "path \"dev/*\" {}");

        let result = PurgeCoordinator::new(vault.clone(), fast(&["sys/policy"], 3)).run().unwrap();

        assert!(result.is_clean());
        assert_eq!(vault.policy_names(), vec!["default", "root"]);
        assert_eq!(vault.calls_of(Op::DeletePolicy).len(), 2);
    }

    #[test]
    fn test_delete_failure_reported() {
        let vault = vault();
        vault.seed("secret/a/x", SecretData::new().with("k", "v"));
        vault.fail(Op::Delete, "secret/a/x", 5);

        let result = PurgeCoordinator::new(vault.clone(), fast(&["secret/a"], 2)).run().unwrap();

        assert!(!result.is_clean());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, "secret/a/x");
    }
}
