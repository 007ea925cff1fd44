use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use embedb::{EnvFlags, Environment, Error, Transaction, PAGE_SIZE};
use tempfile::TempDir;

fn read_page(path: &Path, pgno: u64) -> Vec<u8> {
    let mut file = OpenOptions::new().read(true).open(path).unwrap();
    file.seek(SeekFrom::Start(pgno * PAGE_SIZE as u64)).unwrap();
    let mut buf = vec![0u8; PAGE_SIZE];
    file.read_exact(&mut buf).unwrap();
    buf
}

fn write_at(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

fn commit_value(env: &Environment, key: &[u8], value: &[u8]) {
    let mut txn = env.begin_write().unwrap();
    txn.put(key, value).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_crash_before_meta_write_keeps_previous_version() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.edb");
    let env = Environment::open(&path, 16 << 20, false).unwrap();
    commit_value(&env, b"k", b"v1");
    // txn 2 will write slot 0; keep what is there now
    let slot0_before = read_page(&path, 0);
    commit_value(&env, b"k", b"v2");
    env.close().unwrap();

    // data pages of txn 2 reached the disk, its meta did not
    write_at(&path, 0, &slot0_before);

    let env = Environment::open(&path, 16 << 20, false).unwrap();
    {
        let txn = env.begin_read().unwrap();
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.get(b"k").unwrap(), Some(&b"v1"[..]));
    }

    // the recovered file keeps working
    commit_value(&env, b"k", b"v3");
    commit_value(&env, b"other", b"x");
    env.close().unwrap();
    let env = Environment::open(&path, 16 << 20, true).unwrap();
    let txn = env.begin_read().unwrap();
    assert_eq!(txn.id(), 3);
    assert_eq!(txn.get(b"k").unwrap(), Some(&b"v3"[..]));
    assert_eq!(txn.stat().entries, 2);
}

#[test]
fn test_both_metas_invalid() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.edb");
    let env = Environment::open(&path, 16 << 20, false).unwrap();
    commit_value(&env, b"k", b"v");
    env.close().unwrap();

    write_at(&path, 16, &[0u8; 4]);
    write_at(&path, PAGE_SIZE as u64 + 16, &[0u8; 4]);
    assert!(matches!(
        Environment::open(&path, 16 << 20, false),
        Err(Error::Invalid)
    ));
}

#[test]
fn test_corrupt_data_page_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.edb");
    let env = Environment::open(&path, 16 << 20, false).unwrap();
    commit_value(&env, b"k", b"v");
    env.close().unwrap();

    // page 2 is the first page handed out: the root leaf
    write_at(&path, 2 * PAGE_SIZE as u64 + 100, &[0xAB]);

    let env = Environment::open(&path, 16 << 20, true).unwrap();
    let txn = env.begin_read().unwrap();
    assert!(matches!(txn.get(b"k"), Err(Error::CorruptPage { pgno: 2 })));
    drop(txn);
    env.close().unwrap();

    // with verification off the untouched entry still reads
    let env = Environment::builder()
        .map_size(16 << 20)
        .flags(EnvFlags::RDONLY | EnvFlags::NOCHECKSUM)
        .open(&path)
        .unwrap();
    assert_eq!(env.begin_read().unwrap().get(b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn test_version_mismatch() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.edb");
    Environment::open(&path, 1 << 20, false)
        .unwrap()
        .close()
        .unwrap();
    write_at(&path, 20, &7u32.to_le_bytes());
    write_at(&path, PAGE_SIZE as u64 + 20, &7u32.to_le_bytes());
    assert!(matches!(
        Environment::open(&path, 1 << 20, false),
        Err(Error::VersionMismatch(7))
    ));
}
