use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use embedb::{Environment, Error, Transaction, WriteWait};
use tempfile::TempDir;

fn setup_test_env(wait: WriteWait) -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::builder()
        .map_size(64 << 20)
        .write_wait(wait)
        .open(temp_dir.path().join("data.edb"))
        .unwrap();
    (temp_dir, env)
}

#[test]
fn test_reader_keeps_its_snapshot() {
    let (_dir, env) = setup_test_env(WriteWait::NoWait);
    let mut txn = env.begin_write().unwrap();
    txn.put(b"k", b"old").unwrap();
    txn.commit().unwrap();

    let reader = env.begin_read().unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            let mut txn = env.begin_write().unwrap();
            txn.put(b"k", b"new").unwrap();
            txn.put(b"k2", b"added").unwrap();
            txn.commit().unwrap();
        });
    });

    assert_eq!(reader.get(b"k").unwrap(), Some(&b"old"[..]));
    assert_eq!(reader.get(b"k2").unwrap(), None);
    let fresh = env.begin_read().unwrap();
    assert_eq!(fresh.get(b"k").unwrap(), Some(&b"new"[..]));
    assert_eq!(fresh.id(), reader.id() + 1);
}

#[test]
fn test_readers_see_whole_commits() {
    let (_dir, env) = setup_test_env(WriteWait::NoWait);
    let keys: Vec<Vec<u8>> = (0..200).map(|i| format!("slot-{:04}", i).into_bytes()).collect();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for round in 0u32..100 {
                let mut txn = env.begin_write().unwrap();
                for k in &keys {
                    txn.put(k, &round.to_le_bytes()).unwrap();
                }
                txn.commit().unwrap();
            }
            done.store(true, Ordering::Release);
        });

        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let txn = env.begin_read().unwrap();
                    let values = txn.get_multi(&keys).unwrap();
                    // every key carries the same round, or none exist yet
                    let first = values[0];
                    assert!(values.iter().all(|v| *v == first));
                    if txn.id() > 0 {
                        assert_eq!(first, Some(&(txn.id() as u32 - 1).to_le_bytes()[..]));
                    }
                }
            });
        }
    });
    assert!(env.reader_list().is_empty());
}

#[test]
fn test_blocking_writers_serialize() {
    let (_dir, env) = setup_test_env(WriteWait::Block);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    let mut txn = env.begin_write().unwrap();
                    let current = txn
                        .get(b"counter")
                        .unwrap()
                        .map(|v| u64::from_le_bytes(v.try_into().unwrap()))
                        .unwrap_or(0);
                    txn.put(b"counter", &(current + 1).to_le_bytes()).unwrap();
                    txn.commit().unwrap();
                }
            });
        }
    });
    let txn = env.begin_read().unwrap();
    assert_eq!(txn.get(b"counter").unwrap(), Some(&100u64.to_le_bytes()[..]));
    assert_eq!(txn.id(), 100);
}

#[test]
fn test_write_conflict_policies() {
    let (_dir, env) = setup_test_env(WriteWait::Timeout(Duration::from_millis(50)));
    let held = env.begin_write().unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            assert!(matches!(env.begin_write(), Err(Error::WriteConflict)));
        });
    });
    drop(held);
    env.begin_write().unwrap().commit().unwrap();
}

#[test]
fn test_reader_pins_pages_until_closed() {
    let (_dir, env) = setup_test_env(WriteWait::NoWait);
    let mut txn = env.begin_write().unwrap();
    for i in 0u32..500 {
        txn.put(&i.to_be_bytes(), &[1u8; 200]).unwrap();
    }
    txn.commit().unwrap();

    let reader = env.begin_read().unwrap();
    for round in 0u8..10 {
        let mut txn = env.begin_write().unwrap();
        for i in 0u32..500 {
            txn.put(&i.to_be_bytes(), &[round; 200]).unwrap();
        }
        txn.commit().unwrap();
    }

    // none of the rewrites touched the pinned version
    for i in 0u32..500 {
        assert_eq!(reader.get(&i.to_be_bytes()).unwrap(), Some(&[1u8; 200][..]));
    }
    assert_eq!(env.reader_list()[0].txn_id, 1);
}

#[test]
fn test_file_stays_bounded_without_readers() {
    let (_dir, env) = setup_test_env(WriteWait::NoWait);
    let rewrite = |round: u8| {
        let mut txn = env.begin_write().unwrap();
        for i in 0u32..300 {
            txn.put(&i.to_be_bytes(), &[round; 100]).unwrap();
        }
        txn.commit().unwrap();
    };

    for round in 0..10 {
        rewrite(round);
    }
    let warm = env.info();
    for round in 10..200 {
        rewrite(round);
    }
    let after = env.info();
    assert_eq!(after.last_txnid, 200);
    assert!(
        after.last_pgno <= warm.last_pgno + 2,
        "file kept growing: {} -> {}",
        warm.last_pgno,
        after.last_pgno
    );
    assert!(after.file_size <= warm.file_size * 2);
}
