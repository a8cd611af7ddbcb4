//! Write-ahead log lifecycle: append, seal, scan, apply, reopen.

use tempfile::TempDir;
use warren::wal::{SyncMode, Wal, WalOptions};

fn wal_options() -> WalOptions {
    WalOptions {
        sync_mode: SyncMode::Fsync,
    }
}

fn msg(i: u8) -> Vec<u8> {
    let mut val = b"msg.".to_vec();
    val.push(i);
    val
}

#[test]
fn test_empty_log_is_clean() {
    let dir = TempDir::new().unwrap();
    let (wal, need_recovery) = Wal::open(dir.path().join("test.log"), wal_options()).unwrap();
    assert!(!need_recovery);
    assert!(wal.scan().is_empty());
    wal.close().unwrap();
}

#[test]
fn test_sealed_log_requires_recovery() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.log");
    {
        let (wal, need_recovery) = Wal::open(&path, wal_options()).unwrap();
        assert!(!need_recovery);

        let writer = wal.new_writer().unwrap();
        for i in 0..255 {
            writer.append(&msg(i)).unwrap().recv().unwrap().unwrap();
        }
        writer.signal_init_write(255).unwrap();
        wal.close().unwrap();
    }

    let (wal, need_recovery) = Wal::open(&path, wal_options()).unwrap();
    assert!(need_recovery, "sealed unapplied segment requires recovery");
    wal.close().unwrap();
}

#[test]
fn test_apply_cycle_empties_log() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.log");
    {
        let (wal, _) = Wal::open(&path, wal_options()).unwrap();
        let writer = wal.new_writer().unwrap();
        for i in 0..255 {
            writer.append(&msg(i)).unwrap().recv().unwrap().unwrap();
        }
        writer.signal_init_write(255).unwrap();
        wal.close().unwrap();
    }

    {
        let (wal, need_recovery) = Wal::open(&path, wal_options()).unwrap();
        assert!(need_recovery);

        let seqs = wal.scan();
        assert_eq!(seqs.len(), 1, "one segment to replay");
        for time_id in seqs {
            let records = wal.read(time_id).unwrap();
            assert_eq!(records.len(), 255);
            for (i, record) in records.iter().enumerate() {
                assert_eq!(record, &msg(i as u8));
            }
            wal.signal_log_applied(time_id).unwrap();
        }
        wal.close().unwrap();
    }

    let (wal, need_recovery) = Wal::open(&path, wal_options()).unwrap();
    assert!(!need_recovery, "applied log is clean");
    assert!(wal.scan().is_empty());
    wal.close().unwrap();
}

#[test]
fn test_append_acks_are_durable_without_seal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.log");
    {
        let (wal, _) = Wal::open(&path, wal_options()).unwrap();
        let writer = wal.new_writer().unwrap();
        for i in 0..10 {
            writer.append(&msg(i)).unwrap().recv().unwrap().unwrap();
        }
        // Crash before signal_init_write.
        wal.close().unwrap();
    }

    let (wal, need_recovery) = Wal::open(&path, wal_options()).unwrap();
    assert!(need_recovery, "acked records must be recoverable");
    let seqs = wal.scan();
    assert_eq!(seqs.len(), 1);
    assert_eq!(wal.read(seqs[0]).unwrap().len(), 10);
    wal.close().unwrap();
}

#[test]
fn test_segments_scan_in_order() {
    let dir = TempDir::new().unwrap();
    let (wal, _) = Wal::open(dir.path().join("test.log"), wal_options()).unwrap();

    let mut time_ids = Vec::new();
    for round in 0..3 {
        let writer = wal.new_writer().unwrap();
        writer.append(&msg(round)).unwrap().recv().unwrap().unwrap();
        writer.signal_init_write(round as u64 + 1).unwrap();
        time_ids.push(writer.time_id());
    }

    assert_eq!(wal.scan(), time_ids, "ascending time ids");
    for &time_id in &time_ids {
        assert_eq!(wal.read(time_id).unwrap().len(), 1);
    }
    wal.close().unwrap();
}
