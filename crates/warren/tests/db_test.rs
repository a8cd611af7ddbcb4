//! End-to-end tests for the store surface: publish, wildcard queries,
//! contracts, TTL expiry, deletes and durability across reopen.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use warren::wal::SyncMode;
use warren::{Db, Entry, Options, Query, StoreError};

fn test_options(dir: &std::path::Path) -> Options {
    let mut opts = Options::default().with_dir(dir);
    // Background workers stay out of the way; tests sync explicitly.
    opts.sync_interval = Duration::from_secs(3600);
    opts.exp_duration = Duration::from_secs(3600);
    opts.log_release_duration = Duration::from_millis(10);
    opts.wal.sync_mode = SyncMode::None;
    opts
}

#[test]
fn test_wildcard_fan_in_query() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("example", test_options(dir.path())).unwrap();

    db.put("teams.alpha.ch1", "m1").unwrap();
    db.put("teams.alpha.ch1.*", "m2").unwrap();
    db.put("teams.alpha...", "m3").unwrap();

    // The channel query collects the literal, the trailing single wildcard
    // and the multi wildcard publishes, newest first.
    let msgs = db
        .get(Query::new("teams.alpha.ch1?last=1h").with_limit(10))
        .unwrap();
    assert_eq!(
        msgs,
        vec![b"m3".to_vec(), b"m2".to_vec(), b"m1".to_vec()]
    );

    // A sibling channel only sees the multi wildcard publish.
    let msgs = db
        .get(Query::new("teams.alpha.ch2?last=1h").with_limit(10))
        .unwrap();
    assert_eq!(msgs, vec![b"m3".to_vec()]);

    db.close().unwrap();
}

#[test]
fn test_wildcard_subsumption() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("sub", test_options(dir.path())).unwrap();

    db.put("a.b.c", "m").unwrap();
    for query in ["a.b.c", "a.b.*", "a.*.c", "a..."] {
        let msgs = db
            .get(Query::new(format!("{query}?last=1h")))
            .unwrap();
        assert_eq!(msgs, vec![b"m".to_vec()], "query `{query}`");
    }
    assert!(db.get(Query::new("a.b?last=1h")).unwrap().is_empty());

    db.close().unwrap();
}

#[test]
fn test_durability_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open("durable", test_options(dir.path())).unwrap();
        db.put("sensors.room1.temp", "21.5").unwrap();
        db.sync().unwrap();
        db.close().unwrap();
    }

    let db = Db::open("durable", test_options(dir.path())).unwrap();
    let msgs = db.get(Query::new("sensors.room1.temp?last=1h")).unwrap();
    assert_eq!(msgs, vec![b"21.5".to_vec()]);

    // Wildcard matching works for topics restored from disk too.
    let msgs = db.get(Query::new("sensors.*.temp?last=1h")).unwrap();
    assert_eq!(msgs, vec![b"21.5".to_vec()]);
    db.close().unwrap();
}

#[test]
fn test_seq_monotonic() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("seq", test_options(dir.path())).unwrap();

    let mut last = 0;
    for i in 0..50 {
        let id = db.put("a.b", format!("m{i}")).unwrap();
        assert!(id.seq() > last, "seq must strictly increase");
        last = id.seq();
    }
    db.close().unwrap();
}

#[test]
fn test_seq_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let last = {
        let db = Db::open("seq2", test_options(dir.path())).unwrap();
        for i in 0..10 {
            db.put("a.b", format!("m{i}")).unwrap();
        }
        let last = db.put("a.b", "final").unwrap().seq();
        db.close().unwrap();
        last
    };

    let db = Db::open("seq2", test_options(dir.path())).unwrap();
    let id = db.put("a.b", "after-reopen").unwrap();
    assert!(id.seq() > last);
    db.close().unwrap();
}

#[test]
fn test_concurrent_puts_same_topic() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Db::open("conc", test_options(dir.path())).unwrap());

    std::thread::scope(|scope| {
        for worker in 0..2 {
            let db = Arc::clone(&db);
            scope.spawn(move || {
                for i in 0..50 {
                    db.put("chat.room1", format!("w{worker}-{i}")).unwrap();
                }
            });
        }
    });

    let msgs = db
        .get(Query::new("chat.room1?last=1h").with_limit(200))
        .unwrap();
    assert_eq!(msgs.len(), 100);

    // Every message is distinct; no write was lost or duplicated.
    let mut unique: Vec<_> = msgs.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 100);
    db.close().unwrap();
}

#[test]
fn test_contract_isolation() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("contracts", test_options(dir.path())).unwrap();

    let contract = db.new_contract();
    db.put_entry(Entry::new("teams.alpha.ch1", "private").with_contract(contract))
        .unwrap();
    db.put("teams.alpha.ch1", "public").unwrap();

    let msgs = db
        .get(Query::new("teams.alpha.ch1?last=1h").with_contract(contract))
        .unwrap();
    assert_eq!(msgs, vec![b"private".to_vec()]);

    let msgs = db.get(Query::new("teams.alpha.ch1?last=1h")).unwrap();
    assert_eq!(msgs, vec![b"public".to_vec()]);

    // Wildcards do not cross the namespace either.
    let msgs = db
        .get(Query::new("teams.alpha.*?last=1h").with_contract(contract))
        .unwrap();
    assert_eq!(msgs, vec![b"private".to_vec()]);
    db.close().unwrap();
}

#[test]
fn test_ttl_expiry_reclaims_space() {
    let dir = TempDir::new().unwrap();
    let mut opts = test_options(dir.path());
    // Fast expirer so the reclaim pass runs within the test.
    opts.exp_duration = Duration::from_millis(100);
    let db = Db::open("ttl", opts).unwrap();

    db.put("teams.alpha.ch1.u1?ttl=1s", "m").unwrap();
    db.sync().unwrap();
    assert_eq!(
        db.get(Query::new("teams.alpha.ch1.u1?last=1h")).unwrap().len(),
        1
    );

    std::thread::sleep(Duration::from_millis(1200));

    // Expired: the query drops it and routes it to the expiry bucket.
    assert!(db
        .get(Query::new("teams.alpha.ch1.u1?last=1h"))
        .unwrap()
        .is_empty());

    // The background expirer reclaims the data-file region.
    let expected = 8 + "teams.alpha.ch1.u1".len() as u64 + 1;
    let mut reclaimed = 0;
    for _ in 0..50 {
        reclaimed = db.stats().free_bytes;
        if reclaimed > 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(reclaimed, expected);
    db.close().unwrap();
}

#[test]
fn test_delete_entry() {
    let dir = TempDir::new().unwrap();
    let mut opts = test_options(dir.path());
    opts.mutable = true;
    let db = Db::open("del", opts).unwrap();

    let id = db.new_id();
    db.put_entry(Entry::new("teams.alpha.ch1.u1", "m").with_id(id))
        .unwrap();
    db.sync().unwrap();

    db.delete_entry(Entry::new("teams.alpha.ch1.u1", "").with_id(id))
        .unwrap();
    assert!(db
        .get(Query::new("teams.alpha.ch1.u1?last=1h"))
        .unwrap()
        .is_empty());
    assert!(db.stats().free_bytes > 0, "slot region was reclaimed");
    db.close().unwrap();
}

#[test]
fn test_delete_requires_mutable() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("imm", test_options(dir.path())).unwrap();

    let id = db.new_id();
    db.put_entry(Entry::new("a.b", "m").with_id(id)).unwrap();
    let err = db.delete_entry(Entry::new("a.b", "").with_id(id));
    assert!(matches!(err, Err(StoreError::Immutable)));
    db.close().unwrap();
}

#[test]
fn test_duplicate_put_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("dup", test_options(dir.path())).unwrap();

    let id = db.new_id();
    db.put_entry(Entry::new("a.b", "m").with_id(id)).unwrap();
    db.put_entry(Entry::new("a.b", "m").with_id(id)).unwrap();
    db.sync().unwrap();

    let msgs = db.get(Query::new("a.b?last=1h")).unwrap();
    assert_eq!(msgs, vec![b"m".to_vec()], "same id stored once");
    db.close().unwrap();
}

#[test]
fn test_query_limit() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("limit", test_options(dir.path())).unwrap();

    for i in 0..10 {
        db.put("a.b", format!("m{i}")).unwrap();
    }
    let msgs = db.get(Query::new("a.b?last=1h").with_limit(3)).unwrap();
    assert_eq!(
        msgs,
        vec![b"m9".to_vec(), b"m8".to_vec(), b"m7".to_vec()]
    );

    // `limit=` in the query string works the same way.
    let msgs = db.get(Query::new("a.b?last=1h&limit=2")).unwrap();
    assert_eq!(msgs.len(), 2);
    db.close().unwrap();
}

#[test]
fn test_backpressure_forces_sync() {
    let dir = TempDir::new().unwrap();
    let mut opts = test_options(dir.path());
    opts.mem_size = 256;
    let db = Db::open("pressure", opts).unwrap();
    for i in 0..20 {
        db.put("a.b", format!("payload-{i:04}")).unwrap();
    }
    let stats = db.stats();
    assert!(stats.syncs > 0, "cache overflow must force sync rounds");
    assert!(stats.cache_bytes <= 512, "cache was drained");
    db.close().unwrap();
}

#[test]
fn test_caller_errors() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("errs", test_options(dir.path())).unwrap();

    assert!(matches!(
        db.put("a..b", "m"),
        Err(StoreError::BadTopic(_))
    ));
    assert!(matches!(
        db.get(Query::new("a.b?last=nope")),
        Err(StoreError::BadTopic(_))
    ));

    db.close().unwrap();
    assert!(matches!(db.put("a.b", "m"), Err(StoreError::Closed)));
    assert!(matches!(db.get(Query::new("a.b")), Err(StoreError::Closed)));
}

#[test]
fn test_stats_counters() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("stats", test_options(dir.path())).unwrap();

    db.put("a.b", "hello").unwrap();
    db.put("a.b", "world").unwrap();
    db.sync().unwrap();
    db.get(Query::new("a.b?last=1h")).unwrap();

    let stats = db.stats();
    assert_eq!(stats.puts, 2);
    assert_eq!(stats.gets, 1);
    assert_eq!(stats.syncs, 2);
    assert_eq!(stats.msg_count, 2);
    assert_eq!(stats.in_bytes, 10);
    db.close().unwrap();
}
