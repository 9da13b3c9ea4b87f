//! Benchmarks for vault-walker
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn benchmark_queue_operations(c: &mut Criterion) {
    use vault_walker::walker::queue::{RecvOutcome, SendOutcome, WorkQueue};

    c.bench_function("queue_send_recv", |b| {
        let (sender, receiver) = WorkQueue::new(10000).split();

        b.iter(|| {
            let sent = sender.send(String::from("secret/app/path"));
            debug_assert!(matches!(sent, SendOutcome::Sent));
            if let RecvOutcome::Item(item) = receiver.recv_polling() {
                black_box(item);
            }
        })
    });
}

fn benchmark_path_operations(c: &mut Criterion) {
    use vault_walker::path;

    c.bench_function("path_sanitize", |b| {
        b.iter(|| black_box(path::sanitize(black_box("//secret/team/app/"))))
    });

    c.bench_function("path_insert_after_mount", |b| {
        b.iter(|| black_box(path::insert_after_mount(black_box("kv/team/app/db"), "kv/", "data")))
    });
}

fn benchmark_memory_dump(c: &mut Criterion) {
    use vault_walker::vault::MountProtocol;
    use vault_walker::walker::{DumpCoordinator, DumpOptions};
    use vault_walker::{MemoryVault, SecretData};

    let vault = Arc::new(MemoryVault::new());
    vault.mount("kv", MountProtocol::V2);
    for i in 0..50 {
        for j in 0..20 {
            vault.seed(&format!("kv/app{i}/secret{j}"), SecretData::new().with("value", j));
        }
    }

    c.bench_function("dump_1000_secrets", |b| {
        b.iter(|| {
            let options = DumpOptions::new(vec!["kv".into()], 8);
            let result = DumpCoordinator::new(vault.clone(), options).run();
            black_box(result.map(|r| r.secrets.len()).unwrap_or(0))
        })
    });
}

criterion_group!(
    benches,
    benchmark_queue_operations,
    benchmark_path_operations,
    benchmark_memory_dump
);
criterion_main!(benches);
