use std::collections::BTreeMap;

use embedb::{Environment, Transaction};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    Commit,
    Abort,
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    // a small alphabet so deletes and overwrites hit existing keys
    prop::collection::vec(b'a'..=b'f', 1..6)
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        8 => prop::collection::vec(any::<u8>(), 0..64),
        1 => prop::collection::vec(any::<u8>(), 1000..6000),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => key_strategy().prop_map(Op::Delete),
        1 => Just(Op::Commit),
        1 => Just(Op::Abort),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_matches_ordered_map(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path().join("data.edb"), 64 << 20, false).unwrap();
        let mut committed: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut pending = committed.clone();
        let mut txn = env.begin_write().unwrap();

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    txn.put(&k, &v).unwrap();
                    pending.insert(k, v);
                }
                Op::Delete(k) => {
                    let found = txn.delete(&k).unwrap();
                    prop_assert_eq!(found, pending.remove(&k).is_some());
                }
                Op::Commit => {
                    txn.commit().unwrap();
                    committed = pending.clone();
                    txn = env.begin_write().unwrap();
                }
                Op::Abort => {
                    txn.abort();
                    pending = committed.clone();
                    txn = env.begin_write().unwrap();
                }
            }
        }
        txn.commit().unwrap();

        let read = env.begin_read().unwrap();
        prop_assert_eq!(read.stat().entries, pending.len());
        let stored: Vec<(Vec<u8>, Vec<u8>)> = read
            .cursor()
            .unwrap()
            .iter()
            .map(|entry| entry.map(|(k, v)| (k.to_vec(), v.to_vec())))
            .collect::<Result<_, _>>()
            .unwrap();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = pending.into_iter().collect();
        prop_assert_eq!(stored, expected);
    }

    #[test]
    fn prop_reopen_preserves_contents(
        pairs in prop::collection::btree_map(key_strategy(), value_strategy(), 0..80)
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.edb");
        {
            let env = Environment::open(&path, 64 << 20, false).unwrap();
            let mut txn = env.begin_write().unwrap();
            txn.put_multi(pairs.iter()).unwrap();
            txn.commit().unwrap();
            env.close().unwrap();
        }
        let env = Environment::open(&path, 64 << 20, true).unwrap();
        let txn = env.begin_read().unwrap();
        for (k, v) in &pairs {
            prop_assert_eq!(txn.get(k).unwrap(), Some(v.as_slice()));
        }
        prop_assert_eq!(txn.get(b"zzzz").unwrap(), None);
    }
}
