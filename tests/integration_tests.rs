//! Integration tests for vault-walker
//!
//! All tests run against the in-process `MemoryVault`; no server needed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use vault_walker::config::IgnoreRules;
use vault_walker::output::{FailureReport, OutputTarget};
use vault_walker::vault::memory::Op;
use vault_walker::vault::{MountProtocol, ProtocolResolver};
use vault_walker::walker::queue::POLL_INTERVAL;
use vault_walker::walker::{
    load_bundle, DumpCoordinator, DumpOptions, ImportOptions, LoadCoordinator, PurgeCoordinator, PurgeOptions,
    RetryPolicy,
};
use vault_walker::{MemoryVault, SecretData, VaultStore};

fn vault() -> Arc<MemoryVault> {
    let vault = Arc::new(MemoryVault::new());
    vault.mount("secret", MountProtocol::V1);
    vault.mount("kv", MountProtocol::V2);
    vault
}

fn no_jitter(retries: u32) -> RetryPolicy {
    RetryPolicy::new(retries).with_jitter_ceiling(Duration::ZERO)
}

fn secret(k: &str, v: &str) -> SecretData {
    SecretData::new().with(k, v)
}

fn remote_calls(vault: &MemoryVault, ops: &[Op]) -> usize {
    vault.calls().iter().filter(|(op, _)| ops.contains(op)).count()
}

/// Set `shutdown` after `delay`; returns the call counts of `ops` taken
/// right at the stop and again once every worker had a poll interval to
/// notice it
fn stop_after(
    vault: Arc<MemoryVault>,
    shutdown: Arc<AtomicBool>,
    delay: Duration,
    ops: &'static [Op],
) -> thread::JoinHandle<(usize, usize)> {
    thread::spawn(move || {
        thread::sleep(delay);
        shutdown.store(true, Ordering::SeqCst);
        let at_stop = remote_calls(&vault, ops);
        thread::sleep(POLL_INTERVAL * 2);
        (at_stop, remote_calls(&vault, ops))
    })
}

#[test]
fn test_dump_complete_for_any_worker_count() {
    for workers in [1, 4, 16] {
        let vault = vault();
        vault.seed("secret/a/b/x", secret("x", "1"));
        vault.seed("secret/a/c", secret("c", "2"));

        let options = DumpOptions::new(vec!["secret/a".into()], workers).with_queue_size(1);
        let result = DumpCoordinator::new(vault.clone(), options).run().unwrap();

        assert!(result.completed, "workers={workers}");
        let keys: Vec<&str> = result.secrets.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["secret/a/b/x", "secret/a/c"], "workers={workers}");
        assert_eq!(result.progress.found, 2);
        assert_eq!(result.progress.processed, 2);
    }
}

#[test]
fn test_dump_wide_tree() {
    let vault = vault();
    for i in 0..40 {
        for j in 0..5 {
            vault.seed(&format!("kv/app{i}/env{j}/creds"), secret("n", &format!("{i}-{j}")));
        }
    }

    let options = DumpOptions::new(vec!["kv".into()], 8).with_queue_size(4);
    let result = DumpCoordinator::new(vault.clone(), options).run().unwrap();

    assert!(result.completed);
    assert_eq!(result.secrets.len(), 200);
    assert_eq!(result.secrets["kv/data/app7/env3/creds"], secret("n", "7-3"));
}

#[test]
fn test_concurrent_resolution_shares_lookup() {
    let vault = vault();
    let store: Arc<dyn VaultStore> = vault.clone();
    let resolver = Arc::new(ProtocolResolver::new(store));
    let callers = 16;

    let handles: Vec<_> = (0..callers)
        .map(|i| {
            let resolver = Arc::clone(&resolver);
            thread::spawn(move || resolver.resolve(&format!("kv/app/{i}")).unwrap())
        })
        .collect();
    let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(resolved.iter().all(|m| m == &resolved[0]));
    assert_eq!(resolved[0].protocol, MountProtocol::V2);
    assert!(vault.mount_lookups() <= callers as u64);

    let before = vault.mount_lookups();
    resolver.resolve("kv/other").unwrap();
    assert_eq!(vault.mount_lookups(), before);
    assert_eq!(resolver.cached_mounts(), 1);
}

#[test]
fn test_ignore_rules_dump_and_import() {
    let ignore = IgnoreRules::new(vec!["secret/skip".into()], vec!["tmp".into()]);

    let source = vault();
    source.seed("secret/keep/a", secret("a", "1"));
    source.seed("secret/keep/b_tmp", secret("b", "2"));
    source.seed("secret/skip/c", secret("c", "3"));

    let options = DumpOptions::new(vec!["secret".into()], 4).with_ignore(ignore.clone());
    let dumped = DumpCoordinator::new(source.clone(), options).run().unwrap();

    let keys: Vec<&str> = dumped.secrets.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["secret/keep/a"]);
    assert!(!source.calls_of(Op::List).iter().any(|p| p.starts_with("secret/skip")));
    let reads = source.calls_of(Op::Read);
    assert!(!reads.iter().any(|p| p.ends_with("b_tmp") || p.starts_with("secret/skip")));

    let target = vault();
    let mut bundle = BTreeMap::new();
    bundle.insert("secret/keep/a".to_string(), secret("a", "1"));
    bundle.insert("secret/skip/c".to_string(), secret("c", "3"));
    bundle.insert("secret/x_tmp".to_string(), secret("x", "4"));

    let options = ImportOptions::new(2).with_ignore(ignore).with_retry(no_jitter(0));
    let result = LoadCoordinator::new(target.clone(), options).run(bundle).unwrap();

    assert!(result.is_clean());
    assert_eq!(target.paths(), vec!["secret/keep/a"]);
    assert_eq!(result.progress.ignored, 2);
}

#[test]
fn test_import_into_unknown_mount_writes_path_as_is() {
    let vault = vault();
    let mut bundle = BTreeMap::new();
    bundle.insert("cubbyhole/app".to_string(), secret("k", "v"));

    let options = ImportOptions::new(1).with_retry(no_jitter(0));
    let result = LoadCoordinator::new(vault.clone(), options).run(bundle).unwrap();

    assert!(result.is_clean());
    assert!(result.tally.is_empty());
    assert_eq!(vault.calls_of(Op::Write), vec!["cubbyhole/app"]);
    assert_eq!(vault.get("cubbyhole/app"), Some(secret("k", "v")));
}

#[test]
fn test_import_retry_bound() {
    let vault = vault();
    vault.fail(Op::Write, "secret/flaky", 10);

    let mut bundle = BTreeMap::new();
    bundle.insert("secret/flaky".to_string(), secret("k", "v"));

    let options = ImportOptions::new(1).with_retry(no_jitter(3));
    let result = LoadCoordinator::new(vault.clone(), options).run(bundle).unwrap();

    assert_eq!(vault.calls_of(Op::Write).len(), 4);
    assert_eq!(result.tally.len(), 1);
    assert!(vault.get("secret/flaky").is_none());
}

#[test]
fn test_import_unbounded_retry_succeeds() {
    let vault = vault();
    vault.fail(Op::Write, "secret/stubborn", 99);

    let mut bundle = BTreeMap::new();
    bundle.insert("secret/stubborn".to_string(), secret("k", "v"));

    let options = ImportOptions::new(1).with_retry(RetryPolicy::unbounded().with_jitter_ceiling(Duration::ZERO));
    let result = LoadCoordinator::new(vault.clone(), options).run(bundle).unwrap();

    assert!(result.is_clean());
    assert_eq!(vault.calls_of(Op::Write).len(), 100);
    assert_eq!(vault.get("secret/stubborn"), Some(secret("k", "v")));
}

#[test]
fn test_v2_dump_then_import_round_trip() {
    let source = vault();
    source.seed("kv/team/db", secret("pw", "hunter2"));
    source.seed("kv/team/api/key", secret("token", "abc"));
    source.seed("secret/legacy", secret("old", "1"));

    let dir = tempdir().unwrap();
    let dumped = DumpCoordinator::new(source.clone(), DumpOptions::new(vec!["kv".into(), "secret".into()], 4))
        .run()
        .unwrap();
    let sink = OutputTarget::File {
        dir: dir.path().to_path_buf(),
        filename: "all".into(),
    };
    let written = sink.write(&dumped.secrets).unwrap();
    let path = sink.file_path().unwrap();
    assert_eq!(written.bytes(), std::fs::metadata(&path).unwrap().len());

    let target = vault();
    let bundle = load_bundle(&path).unwrap();
    let result = LoadCoordinator::new(target.clone(), ImportOptions::new(4).with_retry(no_jitter(0)))
        .run(bundle)
        .unwrap();

    assert!(result.is_clean());
    assert_eq!(target.paths(), source.paths());
    for p in source.paths() {
        assert_eq!(target.get(&p), source.get(&p), "{p}");
    }
}

#[test]
fn test_failure_report_is_replayable() {
    let vault = vault();
    vault.fail(Op::Write, "secret/bad", 2);

    let mut bundle = BTreeMap::new();
    bundle.insert("secret/good".to_string(), secret("k", "1"));
    bundle.insert("secret/bad".to_string(), secret("k", "2"));

    let result = LoadCoordinator::new(vault.clone(), ImportOptions::new(2).with_retry(no_jitter(1)))
        .run(bundle)
        .unwrap();
    assert!(!result.is_clean());

    let dir = tempdir().unwrap();
    let report = FailureReport::write(dir.path(), &result.tally).unwrap().unwrap();
    assert_eq!(report.extension().and_then(|e| e.to_str()), Some("json"));

    let replay = load_bundle(&report).unwrap();
    assert_eq!(replay.keys().collect::<Vec<_>>(), vec!["secret/bad"]);

    let retried = LoadCoordinator::new(vault.clone(), ImportOptions::new(1).with_retry(no_jitter(0)))
        .run(replay)
        .unwrap();
    assert!(retried.is_clean());
    assert_eq!(vault.get("secret/bad"), Some(secret("k", "2")));
}

#[test]
fn test_clean_import_writes_no_report() {
    let vault = vault();
    let mut bundle = BTreeMap::new();
    bundle.insert("secret/a".to_string(), secret("k", "1"));

    let result = LoadCoordinator::new(vault.clone(), ImportOptions::new(1)).run(bundle).unwrap();
    let dir = tempdir().unwrap();

    assert!(FailureReport::write(dir.path(), &result.tally).unwrap().is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_purge_completeness() {
    let vault = vault();
    for p in ["secret/a/b", "secret/a/c/d", "secret/a/c/e/f", "kv/app/x", "secret/other"] {
        vault.seed(p, secret("k", "v"));
    }

    let options = PurgeOptions::new(vec!["secret/a".into(), "kv/app".into()], 6).with_retry(no_jitter(1));
    let result = PurgeCoordinator::new(vault.clone(), options).run().unwrap();

    assert!(result.is_clean());
    assert!(result.completed);
    assert_eq!(vault.paths(), vec!["secret/other"]);
}

#[test]
fn test_purge_policies_spares_builtins() {
    let vault = vault();
    for name in ["ops", "dev", "audit"] {
        vault.seed_policy(name, "path \"*\" { capabilities = [\"read\"] }");
    }

    let options = PurgeOptions::new(vec!["sys/policy".into()], 4).with_retry(no_jitter(1));
    let result = PurgeCoordinator::new(vault.clone(), options).run().unwrap();

    assert!(result.is_clean());
    assert_eq!(vault.policy_names(), vec!["default", "root"]);
    let deleted = vault.calls_of(Op::DeletePolicy);
    assert!(!deleted.iter().any(|n| n == "default" || n == "root"));
}

#[test]
fn test_cancellation_terminates() {
    let vault = vault();
    for i in 0..200 {
        vault.seed(&format!("secret/big/{}/{}", i % 10, i), secret("k", "v"));
    }
    vault.set_latency(Duration::from_millis(5));

    let options = DumpOptions::new(vec!["secret/big".into()], 4).with_queue_size(2);
    let threads = options.workers + options.discovery_threads;
    let coordinator = DumpCoordinator::new(vault.clone(), options);
    let stopper = stop_after(
        vault.clone(),
        coordinator.shutdown_flag(),
        Duration::from_millis(50),
        &[Op::List, Op::Read],
    );

    let start = Instant::now();
    let result = coordinator.run().unwrap();
    let (at_stop, settled) = stopper.join().unwrap();

    assert!(!result.completed);
    assert!(result.secrets.len() < 200);
    assert!(start.elapsed() < Duration::from_secs(10));

    // only calls already in flight may land after the stop
    assert!(settled - at_stop <= threads, "{at_stop} -> {settled}");
    assert_eq!(remote_calls(&vault, &[Op::List, Op::Read]), settled);
}

#[test]
fn test_purge_cancellation_terminates() {
    let vault = vault();
    for i in 0..100 {
        vault.seed(&format!("secret/tree/{}/{}", i % 5, i), secret("k", "v"));
    }
    vault.set_latency(Duration::from_millis(5));

    let workers = 3;
    let coordinator = PurgeCoordinator::new(vault.clone(), PurgeOptions::new(vec!["secret/tree".into()], workers));
    let stopper = stop_after(
        vault.clone(),
        coordinator.shutdown_flag(),
        Duration::from_millis(30),
        &[Op::List, Op::Delete],
    );

    let start = Instant::now();
    let result = coordinator.run().unwrap();
    let (at_stop, settled) = stopper.join().unwrap();

    assert!(!result.completed);
    assert!(start.elapsed() < Duration::from_secs(10));

    assert!(settled - at_stop <= workers, "{at_stop} -> {settled}");
    assert_eq!(remote_calls(&vault, &[Op::List, Op::Delete]), settled);
}

#[test]
fn test_dump_to_nested_filename() {
    let vault = vault();
    vault.seed("secret/app/x", secret("x", "1"));

    let result = DumpCoordinator::new(vault.clone(), DumpOptions::new(vec!["secret/app".into()], 2))
        .run()
        .unwrap();

    let dir = tempdir().unwrap();
    let sink = OutputTarget::File {
        dir: dir.path().join("backup"),
        filename: "secret/app".into(),
    };
    sink.write(&result.secrets).unwrap();

    let path = dir.path().join("backup/secret/app.json");
    assert_eq!(sink.file_path(), Some(path.clone()));
    let loaded = load_bundle(&path).unwrap();
    assert_eq!(loaded["secret/app/x"], secret("x", "1"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
