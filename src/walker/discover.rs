//! Tree discovery
//!
//! Walks one or more roots and emits every leaf into a bounded queue.
//!
//! ```text
//! Branch injector (crossbeam deque)
//! │
//! ├── Discovery 0: steal branch → LIST → push child branches → send leaves
//! ├── Discovery 1: steal branch → LIST → push child branches → send leaves
//! └── Discovery N: ...
//!                                   │
//!                                   ▼
//!                        bounded leaf queue → leaf workers
//! ```
//!
//! Every listed directory becomes an independent branch task, so sibling
//! subtrees are explored in parallel. The walk is over when the pending
//! branch counter drops to zero; the last discovery thread to exit drops
//! its leaf sender and the leaf queue closes.
//!
//! A branch whose listing fails or comes back empty is treated as a leaf.
//! Vault answers "no children", "permission denied on list" and "this is a
//! secret" the same way from the caller's point of view.

use crate::config::IgnoreRules;
use crate::error::{Result, RunError, WorkerError};
use crate::path;
use crate::vault::kv::MountInfo;
use crate::vault::{ProtocolResolver, VaultStore};
use crate::walker::queue::{steal, PendingWork, SendOutcome, WorkQueueSender};
use crate::walker::stats::RunStats;
use crossbeam_deque::Injector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Pause between empty steals while other threads may still push work
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// A path known to have no children, in read form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLeaf {
    pub path: String,
}

/// A directory to list, in listing form
#[derive(Debug, Clone)]
struct Branch {
    path: String,
    /// Mount owning the branch; v2 listing forms carry `metadata`
    mount: Arc<MountInfo>,
    root: bool,
}

impl Branch {
    fn read_form(&self, path: &str) -> String {
        if self.mount.protocol.is_v2() {
            path::list_to_read_form(path, &self.mount.mount_path)
        } else {
            path.to_string()
        }
    }
}

/// What a branch asks of its thread after being expanded
enum Flow {
    Continue,
    /// Shutdown observed or nobody is reading leaves anymore
    Stop,
}

/// State shared by all discovery threads
struct Shared {
    store: Arc<dyn VaultStore>,
    ignore: Arc<IgnoreRules>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunStats>,
    injector: Injector<Branch>,
    pending: PendingWork,
}

/// Parallel tree walker feeding a leaf queue
pub struct Discoverer {
    store: Arc<dyn VaultStore>,
    resolver: Arc<ProtocolResolver>,
    ignore: Arc<IgnoreRules>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunStats>,
}

/// Running discovery threads
pub struct DiscoveryHandle {
    handles: Vec<(String, JoinHandle<Result<()>>)>,
}

impl Discoverer {
    pub fn new(
        store: Arc<dyn VaultStore>,
        resolver: Arc<ProtocolResolver>,
        ignore: Arc<IgnoreRules>,
        shutdown: Arc<AtomicBool>,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            store,
            resolver,
            ignore,
            shutdown,
            stats,
        }
    }

    /// Resolve a root into its listing form
    ///
    /// A failed lookup (no permission on the mounts endpoint, system
    /// backends) falls back to the path as given.
    fn seed(&self, root: &str) -> Branch {
        let sanitized = path::sanitize(root);
        let mount = self.resolver.resolve(&sanitized).unwrap_or_else(|e| {
            warn!(path = %sanitized, error = %e, "Mount lookup failed, listing path as-is");
            MountInfo::v1_at(&sanitized)
        });
        Branch {
            path: mount.list_form(&sanitized),
            mount: Arc::new(mount),
            root: true,
        }
    }

    /// Start `threads` discovery threads over `roots`
    ///
    /// `leaves` is moved into the threads; the queue closes once all of
    /// them exit.
    pub fn spawn(
        self,
        roots: &[String],
        leaves: WorkQueueSender<DiscoveredLeaf>,
        threads: usize,
    ) -> Result<DiscoveryHandle> {
        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            ignore: Arc::clone(&self.ignore),
            shutdown: Arc::clone(&self.shutdown),
            stats: Arc::clone(&self.stats),
            injector: Injector::new(),
            pending: PendingWork::new(0),
        });

        for root in roots {
            let branch = self.seed(root);
            debug!(
                root = %root,
                list_path = %branch.path,
                v2 = branch.mount.protocol.is_v2(),
                "Seeding root"
            );
            shared.pending.add(1);
            shared.injector.push(branch);
        }

        let mut handles = Vec::with_capacity(threads.max(1));
        for id in 0..threads.max(1) {
            let name = format!("discover-{id}");
            let shared = Arc::clone(&shared);
            let leaves = leaves.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || discovery_loop(id, &shared, &leaves));

            match spawned {
                Ok(handle) => handles.push((name, handle)),
                Err(e) => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    return Err(WorkerError::SpawnFailed {
                        name,
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }

        Ok(DiscoveryHandle { handles })
    }
}

impl DiscoveryHandle {
    /// Wait for every discovery thread; returns the first error
    pub fn join(self) -> Result<()> {
        let mut first_error = None;
        for (name, handle) in self.handles {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(WorkerError::Panicked { name }.into()),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn discovery_loop(id: usize, shared: &Shared, leaves: &WorkQueueSender<DiscoveredLeaf>) -> Result<()> {
    debug!(thread = id, "Discovery thread started");

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let Some(branch) = steal(&shared.injector) else {
            if shared.pending.is_done() {
                break;
            }
            thread::sleep(IDLE_BACKOFF);
            continue;
        };

        let _guard = shared.pending.guard();
        match shared.expand(branch, leaves) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(e) => {
                // a root that can't be walked aborts the whole run
                shared.shutdown.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
    }

    debug!(thread = id, "Discovery thread finished");
    Ok(())
}

impl Shared {
    fn expand(&self, branch: Branch, leaves: &WorkQueueSender<DiscoveredLeaf>) -> Result<Flow> {
        let entries = match self.store.list(&branch.path) {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => {
                debug!(path = %branch.path, "No children, treating as leaf");
                return Ok(self.emit(&branch, &branch.path, leaves));
            }
            Err(e) => {
                if branch.root {
                    let read_path = branch.read_form(&branch.path);
                    match self.store.read(&read_path) {
                        Err(read_err) if !read_err.is_denied() => {
                            return Err(RunError::RootDiscovery {
                                path: branch.path,
                                reason: format!("list failed ({e}); read failed ({read_err})"),
                            });
                        }
                        _ => {}
                    }
                }
                debug!(path = %branch.path, error = %e, "List failed, treating as leaf");
                return Ok(self.emit(&branch, &branch.path, leaves));
            }
        };

        let mut children = Vec::new();
        let mut leaf_paths = Vec::new();
        for entry in &entries {
            let child = path::join(&branch.path, &entry.name);
            if entry.is_dir() {
                if self.ignore.matches_prefix(&branch.read_form(&child)) {
                    debug!(path = %child, "Ignoring branch");
                    self.stats.inc_ignored();
                    continue;
                }
                children.push(Branch {
                    path: child,
                    mount: Arc::clone(&branch.mount),
                    root: false,
                });
            } else {
                leaf_paths.push(child);
            }
        }

        // drop partially discovered children once cancelled
        if self.shutdown.load(Ordering::Relaxed) {
            return Ok(Flow::Stop);
        }

        self.pending.add(children.len() as u64);
        for child in children {
            self.injector.push(child);
        }

        for leaf in leaf_paths {
            if let Flow::Stop = self.emit(&branch, &leaf, leaves) {
                return Ok(Flow::Stop);
            }
        }

        Ok(Flow::Continue)
    }

    /// Send one leaf (listing form) downstream
    fn emit(&self, branch: &Branch, list_path: &str, leaves: &WorkQueueSender<DiscoveredLeaf>) -> Flow {
        let path = branch.read_form(list_path);
        if self.ignore.matches(&path) {
            debug!(path = %path, "Ignoring leaf");
            self.stats.inc_ignored();
            return Flow::Continue;
        }

        match leaves.send_polling(DiscoveredLeaf { path }, &self.shutdown) {
            SendOutcome::Sent => {
                self.stats.add_found(1);
                Flow::Continue
            }
            SendOutcome::Cancelled | SendOutcome::Closed => Flow::Stop,
        }
    }
}
