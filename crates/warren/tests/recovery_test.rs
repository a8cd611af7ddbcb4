//! Crash recovery and window-chain integrity.

use std::time::Duration;
use tempfile::TempDir;
use warren::fio::PagedFile;
use warren::wal::SyncMode;
use warren::window::{
    writer::WindowWriter, TimeOptions, TimeWindowBucket, WinBlock, WinEntry,
    SEQS_PER_WINDOW_BLOCK,
};
use warren::{Db, Options, Query};

fn test_options(dir: &std::path::Path) -> Options {
    let mut opts = Options::default().with_dir(dir);
    opts.sync_interval = Duration::from_secs(3600);
    opts.exp_duration = Duration::from_secs(3600);
    opts.log_release_duration = Duration::from_millis(10);
    opts.wal.sync_mode = SyncMode::None;
    opts
}

#[test]
fn test_crash_recovery_replays_log() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open("crash", test_options(dir.path())).unwrap();
        for i in 0..255 {
            db.put("logs.app", format!("msg.{i}")).unwrap();
        }
        // Simulate a crash: neither sync nor close runs.
        std::mem::forget(db);
    }

    let db = Db::open("crash", test_options(dir.path())).unwrap();
    let msgs = db
        .get(Query::new("logs.app?last=1h").with_limit(300))
        .unwrap();
    assert_eq!(msgs.len(), 255, "every logged write survives the crash");
    assert_eq!(msgs[0], b"msg.254".to_vec());

    // Recovery restored the sequence counter as well.
    let id = db.put("logs.app", "after").unwrap();
    assert!(id.seq() > 255);

    let stats = db.stats();
    assert_eq!(stats.recovers, 255, "entries accounted to recovery");
    db.close().unwrap();
}

#[test]
fn test_recovered_store_reopens_clean() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open("clean", test_options(dir.path())).unwrap();
        db.put("a.b", "m").unwrap();
        std::mem::forget(db);
    }
    {
        // First reopen replays and applies the log.
        let db = Db::open("clean", test_options(dir.path())).unwrap();
        db.close().unwrap();
    }

    // Second reopen finds an empty log and runs no recovery.
    let db = Db::open("clean", test_options(dir.path())).unwrap();
    assert_eq!(db.stats().recovers, 0);
    let msgs = db.get(Query::new("a.b?last=1h")).unwrap();
    assert_eq!(msgs, vec![b"m".to_vec()]);
    db.close().unwrap();
}

#[test]
fn test_recovery_preserves_ttl() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open("ttl", test_options(dir.path())).unwrap();
        db.put("a.b?ttl=1s", "short").unwrap();
        db.put("a.b", "keeper").unwrap();
        std::mem::forget(db);
    }

    let db = Db::open("ttl", test_options(dir.path())).unwrap();
    std::thread::sleep(Duration::from_millis(1200));
    let msgs = db.get(Query::new("a.b?last=1h")).unwrap();
    assert_eq!(msgs, vec![b"keeper".to_vec()], "ttl survived the replay");
    db.close().unwrap();
}

// A topic whose window chain has rolled over must come back with the
// newest block as its tail after a reopen: appends continue on that block
// and a backward walk still reaches the older blocks.
#[test]
fn test_reopen_restores_multi_block_chain_tail() {
    let dir = TempDir::new().unwrap();
    let total = SEQS_PER_WINDOW_BLOCK + 61; // rolls the first window block
    {
        let db = Db::open("tail", test_options(dir.path())).unwrap();
        for i in 0..total {
            db.put("logs.app", format!("m{i}")).unwrap();
        }
        db.sync().unwrap();
        db.close().unwrap();
    }

    let db = Db::open("tail", test_options(dir.path())).unwrap();

    // Appends after reopen land on the restored tail, not a fresh chain.
    for i in total..total + 50 {
        db.put("logs.app", format!("m{i}")).unwrap();
    }
    db.sync().unwrap();

    let msgs = db
        .get(Query::new("logs.app?last=1h").with_limit(total + 100))
        .unwrap();
    assert_eq!(
        msgs.len(),
        total + 50,
        "entries from the old and the newly-appended blocks are all visible"
    );
    assert_eq!(msgs[0], format!("m{}", total + 49).into_bytes());
    assert_eq!(msgs[total + 49], b"m0".to_vec());
    db.close().unwrap();
}

// Window chains walked from the tail must terminate at zero with strictly
// decreasing offsets, in at most as many hops as there are blocks.
#[test]
fn test_window_chain_terminates() {
    let dir = TempDir::new().unwrap();
    let file = PagedFile::open(dir.path().join("chain.win")).unwrap();
    let bucket = TimeWindowBucket::new(file, TimeOptions::default());

    let total = SEQS_PER_WINDOW_BLOCK as u64 * 3 + 7;
    let entries: Vec<WinEntry> = (1..=total)
        .map(|seq| WinEntry {
            seq,
            expires_at: 0,
        })
        .collect();

    let mut writer = WindowWriter::new(&bucket, Vec::new());
    let tail = writer.append(0xfeed, 0, &entries).unwrap();
    writer.write().unwrap();

    let total_blocks = bucket.window_index() + 1;
    let mut hops = 0;
    let mut off = tail;
    let mut seen = 0usize;
    while off != 0 {
        let block = WinBlock::read(bucket.file(), off as u64).unwrap();
        assert_eq!(block.topic_hash, 0xfeed);
        assert!(
            block.next == 0 || block.next < off,
            "chain offsets strictly decrease"
        );
        seen += block.entry_idx as usize;
        hops += 1;
        assert!(hops <= total_blocks, "chain must terminate");
        off = block.next;
    }
    assert_eq!(seen as u64, total);
    assert_eq!(hops, total_blocks);
}

#[test]
fn test_lookup_respects_cutoff_blocks() {
    let dir = TempDir::new().unwrap();
    let file = PagedFile::open(dir.path().join("cutoff.win")).unwrap();
    let bucket = TimeWindowBucket::new(file, TimeOptions::default());

    // Two full blocks plus a partial tail; full blocks carry a cutoff
    // stamp, the partial tail keeps zero and counts as newest.
    let total = SEQS_PER_WINDOW_BLOCK as u64 * 2 + 5;
    let entries: Vec<WinEntry> = (1..=total)
        .map(|seq| WinEntry {
            seq,
            expires_at: 0,
        })
        .collect();
    let mut writer = WindowWriter::new(&bucket, Vec::new());
    let tail = writer.append(0xabba, 0, &entries).unwrap();
    writer.write().unwrap();

    let tail_block = WinBlock::read(bucket.file(), tail as u64).unwrap();
    assert_eq!(tail_block.cutoff, 0);

    // A cutoff far in the future stops the walk after the first full
    // block it reaches; the partial tail is always read.
    let future = warren::message::unix_now() as i64 + 3600;
    let got = bucket.lookup(0xabba, tail, future, usize::MAX >> 1);
    assert_eq!(got.len(), 5 + SEQS_PER_WINDOW_BLOCK);

    // Without a cutoff the whole chain is read.
    let got = bucket.lookup(0xabba, tail, 0, usize::MAX >> 1);
    assert_eq!(got.len(), total as usize);
}
