//! Benchmarks for the store write and read paths.
//!
//! Run with: cargo bench --package warren

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::time::Duration;
use tempfile::TempDir;
use warren::wal::SyncMode;
use warren::{Db, Options, Query};

fn bench_options(dir: &std::path::Path) -> Options {
    let mut opts = Options::default().with_dir(dir);
    opts.sync_interval = Duration::from_secs(3600);
    opts.exp_duration = Duration::from_secs(3600);
    opts.wal.sync_mode = SyncMode::None;
    opts
}

fn bench_put(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Db::open("bench", bench_options(dir.path())).unwrap();
    let payload = vec![0x5au8; 256];

    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Bytes(256));
    group.bench_function("put_256b", |b| {
        b.iter(|| db.put("bench.topic.a", black_box(payload.clone())).unwrap())
    });
    group.finish();
    db.close().unwrap();
}

fn bench_put_sync(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Db::open("bench_sync", bench_options(dir.path())).unwrap();
    let payload = vec![0x5au8; 256];

    c.bench_function("put_sync_batch_100", |b| {
        b.iter(|| {
            for _ in 0..100 {
                db.put("bench.topic.b", black_box(payload.clone())).unwrap();
            }
            db.sync().unwrap();
        })
    });
    db.close().unwrap();
}

fn bench_get(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Db::open("bench_get", bench_options(dir.path())).unwrap();
    for i in 0..1000 {
        db.put("bench.topic.c", format!("payload-{i}")).unwrap();
    }
    db.sync().unwrap();

    c.bench_function("get_limit_100", |b| {
        b.iter(|| {
            let msgs = db
                .get(Query::new("bench.topic.c?last=1h").with_limit(100))
                .unwrap();
            black_box(msgs)
        })
    });
    db.close().unwrap();
}

fn bench_get_wildcard(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Db::open("bench_wild", bench_options(dir.path())).unwrap();
    for ch in 0..10 {
        for i in 0..100 {
            db.put(format!("teams.alpha.ch{ch}"), format!("m-{ch}-{i}"))
                .unwrap();
        }
    }
    db.sync().unwrap();

    c.bench_function("get_wildcard_limit_100", |b| {
        b.iter(|| {
            let msgs = db
                .get(Query::new("teams.alpha.*?last=1h").with_limit(100))
                .unwrap();
            black_box(msgs)
        })
    });
    db.close().unwrap();
}

criterion_group!(
    benches,
    bench_put,
    bench_put_sync,
    bench_get,
    bench_get_wildcard
);
criterion_main!(benches);
