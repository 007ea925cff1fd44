use std::collections::HashMap;
use std::mem;

use parking_lot::MutexGuard;

use crate::btree::{self, PageAlloc, Snapshot};
use crate::constants::{
    EnvFlags, PageFlags, Pgno, TransactionFlags, TxnId, WriteFlags, OVERFLOW_DATA_OFFSET,
    PAGE_HEADER_SIZE, PAGE_SIZE, P_INVALID,
};
use crate::cursor::Cursor;
use crate::env::{Environment, WriterState};
use crate::error::{Error, Result};
use crate::freelist::{FreeList, RECORDS_PER_PAGE};
use crate::meta::MetaHeader;
use crate::midl::IdList;
use crate::node::{overflow_pages, Node, NodeRef};
use crate::page::{seal, write_u32, PageHeader, ValueRef};
use crate::pager::Pager;
use crate::types::Stat;

/// Read operations shared by both transaction kinds.
///
/// Values borrowed from a transaction stay valid until it ends.
pub trait Transaction: Snapshot {
    /// Snapshot version this transaction reads (read transactions) or will
    /// commit as (write transactions)
    fn id(&self) -> TxnId {
        self.meta().txnid
    }

    fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        btree::get(self, key)
    }

    /// Look up several keys against the same snapshot, in input order
    fn get_multi<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<Vec<Option<&[u8]>>> {
        keys.iter().map(|key| btree::get(self, key.as_ref())).collect()
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(btree::get(self, key)?.is_some())
    }

    /// Open a cursor over the snapshot
    fn cursor(&self) -> Result<Cursor<'_>>
    where
        Self: Sized,
    {
        Cursor::new(self)
    }

    fn stat(&self) -> Stat {
        self.meta().stat()
    }
}

/// A read-only transaction.
///
/// Pins the snapshot that was current when it began: pages reachable from
/// it are not reused until the transaction is closed or dropped.
#[derive(Debug)]
pub struct ReadTxn<'env> {
    /// Reference to environment
    env: &'env Environment,
    /// Snapshot being read
    meta: MetaHeader,
    /// Transaction flags
    flags: TransactionFlags,
}

impl<'env> ReadTxn<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        let meta = env.register_reader()?;
        log::trace!("begin read txn at {}", meta.txnid);
        Ok(ReadTxn {
            env,
            meta,
            flags: TransactionFlags::RDONLY,
        })
    }

    /// End the transaction and release its reader slot
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.flags.contains(TransactionFlags::FINISHED) {
            self.flags.insert(TransactionFlags::FINISHED);
            self.env.release_reader(self.meta.txnid);
        }
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Snapshot for ReadTxn<'_> {
    fn meta(&self) -> &MetaHeader {
        &self.meta
    }

    fn node(&self, pgno: Pgno) -> Result<NodeRef<'_>> {
        if pgno >= self.meta.next_pgno {
            return Err(Error::CorruptPage { pgno });
        }
        let view = self
            .env
            .pager()
            .read_node(pgno, self.env.verify_checksums())?;
        Ok(NodeRef::Page(view))
    }

    fn resolve<'a>(&'a self, value: ValueRef<'a>) -> Result<&'a [u8]> {
        match value {
            ValueRef::Inline(data) => Ok(data),
            ValueRef::Overflow { pgno, len } => {
                self.env
                    .pager()
                    .read_overflow(pgno, len, self.env.verify_checksums())
            }
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.flags.contains(TransactionFlags::FINISHED) {
            return Err(Error::InvalidState);
        }
        Ok(())
    }
}

impl Transaction for ReadTxn<'_> {}

/// The single read-write transaction.
///
/// Holds the writer lock for its whole life. Changes are made to private
/// copies of the touched pages and become visible to new readers only
/// when [`WriteTxn::commit`] succeeds. Dropping without committing aborts.
pub struct WriteTxn<'env> {
    /// Reference to environment
    env: &'env Environment,
    /// Writer lock and committed free list
    writer: MutexGuard<'env, WriterState>,
    /// Meta being built; `txnid` is the id this transaction commits as
    meta: MetaHeader,
    /// Transaction flags
    flags: TransactionFlags,
    /// Copy-on-write nodes, keyed by their new page number
    dirty: HashMap<Pgno, Node>,
    /// Overflow values written in this transaction
    dirty_overflow: HashMap<Pgno, Vec<u8>>,
    /// Free list to commit, with the reusable pages taken out
    freelist: FreeList,
    /// Pages this transaction may allocate without growing the file
    pool: IdList,
    /// Committed pages superseded by this transaction
    freed: Vec<Pgno>,
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("txnid", &self.meta.txnid)
            .field("flags", &self.flags)
            .field("dirty", &self.dirty.len())
            .field("pool", &self.pool.len())
            .field("freed", &self.freed.len())
            .finish()
    }
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn new(env: &'env Environment, writer: MutexGuard<'env, WriterState>) -> Result<Self> {
        let mut meta = env.current_meta();
        let oldest = env.oldest_snapshot();
        let mut freelist = writer.freelist.clone();
        let pool = freelist.take_reclaimable(oldest);
        meta.txnid += 1;
        log::trace!(
            "begin write txn {} ({} reusable pages, oldest reader {})",
            meta.txnid,
            pool.len(),
            oldest
        );
        Ok(WriteTxn {
            env,
            writer,
            meta,
            flags: TransactionFlags::empty(),
            dirty: HashMap::new(),
            dirty_overflow: HashMap::new(),
            freelist,
            pool,
            freed: Vec::new(),
        })
    }

    fn check_usable(&self) -> Result<()> {
        if self.flags.contains(TransactionFlags::FINISHED) {
            return Err(Error::InvalidState);
        }
        if self.flags.contains(TransactionFlags::ERROR) {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    /// Poison the transaction on errors raised after it started changing
    /// pages. Validation errors leave it usable.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Err(Error::KeyExist | Error::BadValSize(_) | Error::InvalidState | Error::BadTxn)
            | Ok(_) => {}
            Err(e) => {
                log::debug!("write txn {} failed: {}", self.meta.txnid, e);
                self.flags.insert(TransactionFlags::ERROR);
            }
        }
        result
    }

    /// Store a key/value pair, replacing any previous value
    pub fn put(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.put_with_flags(key, data, WriteFlags::empty())
    }

    /// Store a key/value pair. With `NOOVERWRITE` an existing key fails
    /// with `Error::KeyExist`.
    pub fn put_with_flags(&mut self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.check_usable()?;
        let result = btree::put(self, key, data, flags);
        self.track(result)
    }

    /// Store several pairs. Pages touched by more than one of them are
    /// copied only once.
    pub fn put_multi<I, K, V>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        for (key, data) in pairs {
            self.put(key.as_ref(), data.as_ref())?;
        }
        Ok(())
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.check_usable()?;
        let result = btree::delete(self, key);
        self.track(result)
    }

    /// Remove several keys, reporting for each whether it was present
    pub fn delete_multi<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<Vec<bool>> {
        keys.iter().map(|key| self.delete(key.as_ref())).collect()
    }

    /// Make the transaction's changes durable and visible.
    ///
    /// Data pages are written and flushed before the meta page, and the
    /// meta goes to the slot not holding the current one, so a crash at any
    /// point leaves either the old or the new version intact.
    pub fn commit(mut self) -> Result<()> {
        self.check_usable()?;
        if !self.flags.contains(TransactionFlags::DIRTY) {
            self.flags.insert(TransactionFlags::FINISHED);
            log::trace!("write txn {} had no changes", self.meta.txnid);
            return Ok(());
        }
        let result = self.write_out();
        if result.is_ok() {
            self.flags.insert(TransactionFlags::FINISHED);
        }
        result
    }

    fn write_out(&mut self) -> Result<()> {
        let env = self.env;
        let pager = env.pager();
        let txnid = self.meta.txnid;

        let mut freelist = mem::take(&mut self.freelist);
        freelist.free_all(txnid, self.freed.iter().copied());
        freelist.free_all(txnid, self.writer.freelist_pages.iter().copied());

        // the chain holding the new list comes out of the pool first
        let mut chain = Vec::new();
        while chain.len() < (freelist.len() + self.pool.len()).div_ceil(RECORDS_PER_PAGE) {
            let pgno = match self.pool.pop_first() {
                Some(pgno) => pgno,
                None => self.allocate_tail(1)?,
            };
            chain.push(pgno);
        }
        // leftover pool pages were never seen by a live snapshot
        freelist.free_all(0, self.pool.iter());
        self.meta.freelist = chain.first().copied().unwrap_or(P_INVALID);
        pager.grow(self.meta.next_pgno * PAGE_SIZE as u64)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        for (&pgno, node) in &self.dirty {
            node.write_to(pgno, &mut buf);
            pager.write(pgno, &buf)?;
        }
        for (&pgno, data) in &self.dirty_overflow {
            pager.write(pgno, &encode_overflow(pgno, data))?;
        }
        for (&pgno, page) in chain.iter().zip(freelist.encode(&chain)) {
            pager.write(pgno, &page)?;
        }

        let flags = env.flags();
        if !flags.contains(EnvFlags::NOSYNC) {
            pager.flush()?;
        }

        self.meta.map_size = pager.map_size() as u64;
        let sync_meta = !flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC);
        self.write_meta(&mut buf, |pager, slot| {
            if sync_meta {
                pager.flush_pages(slot, 1)
            } else {
                Ok(())
            }
        })?;

        env.publish(self.meta);
        self.writer.freelist = freelist;
        self.writer.freelist_pages = chain;
        log::debug!(
            "committed txn {}: {} pages written, {} entries, {} free pages pending",
            txnid,
            self.dirty.len() + self.dirty_overflow.len(),
            self.meta.entries,
            self.writer.freelist.len()
        );
        Ok(())
    }

    /// Write the new meta into its slot, then run `flush` on it.
    ///
    /// On failure the slot gets the last committed meta back: the map may
    /// still reach the disk later, and it must not carry a meta whose pages
    /// the next writer is free to overwrite.
    fn write_meta<F>(&self, buf: &mut [u8], flush: F) -> Result<()>
    where
        F: FnOnce(&Pager, Pgno) -> Result<()>,
    {
        let pager = self.env.pager();
        let slot = self.meta.slot();
        self.meta.write_page(slot, buf);
        let result = pager.write(slot, buf).and_then(|()| flush(pager, slot));
        if let Err(e) = &result {
            log::warn!("meta write of txn {} failed: {}", self.meta.txnid, e);
            self.env.current_meta().write_page(slot, buf);
            if pager.write(slot, buf).is_ok() && !self.env.flags().contains(EnvFlags::NOSYNC) {
                if let Err(e) = pager.flush_pages(slot, 1) {
                    log::warn!("could not flush restored meta slot {}: {}", slot, e);
                }
            }
        }
        result
    }

    /// Discard all changes and release the writer lock
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if !self.flags.contains(TransactionFlags::FINISHED) {
            self.flags.insert(TransactionFlags::FINISHED);
            log::debug!(
                "aborted txn {} ({} dirty pages dropped)",
                self.meta.txnid,
                self.dirty.len() + self.dirty_overflow.len()
            );
        }
    }

    /// Take pages from the end of the file
    fn allocate_tail(&mut self, npages: usize) -> Result<Pgno> {
        let pgno = self.meta.next_pgno;
        if pgno + npages as Pgno > self.env.pager().max_pages() {
            return Err(Error::OutOfSpace);
        }
        self.meta.next_pgno += npages as Pgno;
        Ok(pgno)
    }

    /// Take a run of `npages` pages, preferring reusable ones
    fn allocate(&mut self, npages: usize) -> Result<Pgno> {
        self.flags.insert(TransactionFlags::DIRTY);
        let pgno = match self.pool.take_run(npages) {
            Some(pgno) => pgno,
            None => self.allocate_tail(npages)?,
        };
        log::trace!("txn {} allocated {} page(s) at {}", self.meta.txnid, npages, pgno);
        Ok(pgno)
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        self.discard();
    }
}

fn encode_overflow(pgno: Pgno, data: &[u8]) -> Vec<u8> {
    let npages = overflow_pages(data.len());
    let mut run = vec![0u8; npages * PAGE_SIZE];
    PageHeader::new(pgno, PageFlags::OVERFLOW, 0).write(&mut run);
    write_u32(&mut run, PAGE_HEADER_SIZE, npages as u32);
    run[OVERFLOW_DATA_OFFSET..OVERFLOW_DATA_OFFSET + data.len()].copy_from_slice(data);
    seal(&mut run);
    run
}

impl Snapshot for WriteTxn<'_> {
    fn meta(&self) -> &MetaHeader {
        &self.meta
    }

    fn node(&self, pgno: Pgno) -> Result<NodeRef<'_>> {
        if let Some(node) = self.dirty.get(&pgno) {
            return Ok(NodeRef::Dirty(node));
        }
        if pgno >= self.meta.next_pgno {
            return Err(Error::CorruptPage { pgno });
        }
        let view = self
            .env
            .pager()
            .read_node(pgno, self.env.verify_checksums())?;
        Ok(NodeRef::Page(view))
    }

    fn resolve<'a>(&'a self, value: ValueRef<'a>) -> Result<&'a [u8]> {
        match value {
            ValueRef::Inline(data) => Ok(data),
            ValueRef::Overflow { pgno, len } => match self.dirty_overflow.get(&pgno) {
                Some(data) => Ok(data),
                None => self
                    .env
                    .pager()
                    .read_overflow(pgno, len, self.env.verify_checksums()),
            },
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.flags.contains(TransactionFlags::FINISHED) {
            return Err(Error::InvalidState);
        }
        Ok(())
    }
}

impl PageAlloc for WriteTxn<'_> {
    fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        if self.dirty.contains_key(&pgno) {
            return Ok(pgno);
        }
        let node = match self.node(pgno)? {
            NodeRef::Page(view) => Node::from_view(&view),
            NodeRef::Dirty(node) => node.clone(),
        };
        let copy = self.allocate(1)?;
        self.dirty.insert(copy, node);
        self.freed.push(pgno);
        log::trace!("txn {} copied page {} to {}", self.meta.txnid, pgno, copy);
        Ok(copy)
    }

    fn dirty(&mut self, pgno: Pgno) -> Result<&mut Node> {
        self.dirty.get_mut(&pgno).ok_or(Error::InvalidState)
    }

    fn insert_node(&mut self, node: Node) -> Result<Pgno> {
        let pgno = self.allocate(1)?;
        self.dirty.insert(pgno, node);
        Ok(pgno)
    }

    fn store_overflow(&mut self, data: &[u8]) -> Result<Pgno> {
        let npages = overflow_pages(data.len());
        let pgno = self.allocate(npages)?;
        self.dirty_overflow.insert(pgno, data.to_vec());
        self.meta.overflow_pages += npages as u64;
        Ok(pgno)
    }

    fn release(&mut self, pgno: Pgno, npages: usize) {
        self.flags.insert(TransactionFlags::DIRTY);
        let pages = pgno..pgno + npages as Pgno;
        if self.dirty.remove(&pgno).is_some() || self.dirty_overflow.remove(&pgno).is_some() {
            // never committed: reusable within this transaction
            self.pool.extend(pages);
        } else {
            self.freed.extend(pages);
        }
    }

    fn meta_mut(&mut self) -> &mut MetaHeader {
        self.flags.insert(TransactionFlags::DIRTY);
        &mut self.meta
    }
}

impl Transaction for WriteTxn<'_> {}

#[cfg(test)]
impl WriteTxn<'_> {
    pub(crate) fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub(crate) fn dirty_len(&self) -> usize {
        self.dirty.len() + self.dirty_overflow.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Environment {
        Environment::open(dir.path().join("data.edb"), 1 << 22, false).unwrap()
    }

    #[test]
    fn test_read_your_own_writes() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);
        let mut txn = env.begin_write().unwrap();
        txn.put(b"k", b"v").unwrap();
        assert_eq!(txn.get(b"k").unwrap(), Some(&b"v"[..]));
        assert_eq!(txn.id(), 1);
        txn.commit().unwrap();

        let txn = env.begin_read().unwrap();
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.get(b"k").unwrap(), Some(&b"v"[..]));
    }

    #[test]
    fn test_abort_discards() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);
        let mut txn = env.begin_write().unwrap();
        txn.put(b"k", b"v").unwrap();
        txn.abort();
        assert_eq!(env.begin_read().unwrap().get(b"k").unwrap(), None);
        assert_eq!(env.info().last_txnid, 0);
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);
        let mut txn = env.begin_write().unwrap();
        assert!(!txn.delete(b"nothing").unwrap());
        txn.commit().unwrap();
        assert_eq!(env.info().last_txnid, 0);
    }

    #[test]
    fn test_batch_copies_each_path_page_once() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);
        let key = |i: u32| format!("key-{:08}", i).into_bytes();
        let mut txn = env.begin_write().unwrap();
        for i in 0..2000 {
            txn.put(&key(i), &[7u8; 50]).unwrap();
        }
        txn.commit().unwrap();
        let before = env.stat();
        assert!(before.depth >= 2);

        // every new key sorts right after key 1000, so all land in its leaf
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..8u8)
            .map(|i| ([key(1000), vec![b'a' + i]].concat(), vec![i]))
            .collect();
        let mut txn = env.begin_write().unwrap();
        txn.put(&pairs[0].0, &pairs[0].1).unwrap();
        assert_eq!(txn.dirty_len(), before.depth as usize);
        txn.put_multi(pairs.iter().skip(1).map(|(k, v)| (k, v))).unwrap();
        assert_eq!(txn.dirty_len(), before.depth as usize);
        txn.commit().unwrap();

        let after = env.stat();
        assert_eq!(after.entries, before.entries + pairs.len());
        assert_eq!(after.leaf_pages, before.leaf_pages);
        assert_eq!(after.branch_pages, before.branch_pages);
    }

    #[test]
    fn test_single_writer() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);
        let _txn = env.begin_write().unwrap();
        assert!(matches!(env.begin_write(), Err(Error::WriteConflict)));
    }

    #[test]
    fn test_old_pages_reused_after_readers_leave() {
        let dir = TempDir::new().unwrap();
        let env = open(&dir);
        let mut txn = env.begin_write().unwrap();
        txn.put(b"k", b"v1").unwrap();
        txn.commit().unwrap();

        // a pinned reader keeps the freed page out of the pool
        let reader = env.begin_read().unwrap();
        let mut txn = env.begin_write().unwrap();
        txn.put(b"k", b"v2").unwrap();
        txn.commit().unwrap();
        let txn = env.begin_write().unwrap();
        assert_eq!(txn.pool_len(), 0);
        txn.abort();
        assert_eq!(reader.get(b"k").unwrap(), Some(&b"v1"[..]));
        reader.close();

        let txn = env.begin_write().unwrap();
        assert!(txn.pool_len() > 0);
    }

    #[test]
    fn test_failed_meta_flush_restores_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.edb");
        let env = Environment::open(&path, 1 << 22, false).unwrap();
        let mut txn = env.begin_write().unwrap();
        txn.put(b"k", b"v1").unwrap();
        txn.commit().unwrap();

        // txn 2 never writes its pages; only its meta reaches the map
        let mut txn = env.begin_write().unwrap();
        txn.put(b"k", b"v2").unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        let result = txn.write_meta(&mut buf, |_, _| {
            Err(Error::Io(std::io::Error::other("flush failed")))
        });
        assert!(matches!(result, Err(Error::Io(_))));
        let slot = MetaHeader::read_page(env.pager().bytes(0, 1).unwrap(), 0).unwrap();
        assert_eq!(slot.txnid, 1);
        drop(txn);

        // closing writes the whole map back
        env.close().unwrap();
        let env = Environment::open(&path, 1 << 22, false).unwrap();
        {
            let txn = env.begin_read().unwrap();
            assert_eq!(txn.id(), 1);
            assert_eq!(txn.get(b"k").unwrap(), Some(&b"v1"[..]));
        }
        let mut txn = env.begin_write().unwrap();
        txn.put(b"k", b"v3").unwrap();
        txn.commit().unwrap();
        assert_eq!(env.begin_read().unwrap().get(b"k").unwrap(), Some(&b"v3"[..]));
    }

    #[test]
    fn test_torn_meta_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.edb");
        {
            let env = Environment::open(&path, 1 << 22, false).unwrap();
            let mut txn = env.begin_write().unwrap();
            txn.put(b"a", b"1").unwrap();
            txn.commit().unwrap();
            let mut txn = env.begin_write().unwrap();
            txn.put(b"a", b"2").unwrap();
            txn.commit().unwrap();
            env.close().unwrap();
        }
        // txn 2 lives in slot 0; tear it
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(48)).unwrap();
            file.write_all(&[0xff; 8]).unwrap();
        }
        let env = Environment::open(&path, 1 << 22, false).unwrap();
        let txn = env.begin_read().unwrap();
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.get(b"a").unwrap(), Some(&b"1"[..]));
    }
}
