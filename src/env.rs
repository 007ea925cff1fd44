use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::btree::Snapshot;
use crate::constants::{
    EnvFlags, Pgno, TxnId, DEFAULT_MAP_SIZE, DEFAULT_MAX_READERS, META_PAGES, PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::freelist::FreeList;
use crate::meta::{pick_meta, MetaHeader};
use crate::pager::Pager;
use crate::transaction::{ReadTxn, WriteTxn};
use crate::types::{EnvInfo, ReaderInfo, Stat, WriteWait};

lazy_static! {
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC | EnvFlags::NOCHECKSUM;
}

/// Pages copied per write when backing up
const COPY_CHUNK_PAGES: usize = 256;

/// State owned by the single writer, guarded by the writer mutex
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    /// Committed free list
    pub(crate) freelist: FreeList,
    /// Pages holding the committed free list
    pub(crate) freelist_pages: Vec<Pgno>,
}

/// Options for opening an [`Environment`]
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    map_size: usize,
    flags: EnvFlags,
    max_readers: u32,
    write_wait: WriteWait,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            flags: EnvFlags::empty(),
            max_readers: DEFAULT_MAX_READERS,
            write_wait: WriteWait::default(),
        }
    }
}

impl EnvBuilder {
    /// Maximum size of the data file. The map reserves this much address
    /// space; the file itself grows on demand.
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Maximum number of concurrently open read transactions
    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers;
        self
    }

    /// Behaviour of `begin_write` under contention
    pub fn write_wait(mut self, wait: WriteWait) -> Self {
        self.write_wait = wait;
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Environment> {
        Environment::open_with(path.as_ref(), self)
    }
}

/// An open database file.
///
/// Owns the file, the memory map, the committed meta snapshot, the reader
/// table and the writer lock. Transactions borrow the environment, so it
/// cannot be closed while any of them is alive.
#[derive(Debug)]
pub struct Environment {
    /// Path of the data file
    path: PathBuf,
    /// Environment flags
    flags: EnvFlags,
    /// Maximum number of readers
    max_readers: u32,
    /// Contention policy for writers
    write_wait: WriteWait,
    /// Data file and map
    pager: Pager,
    /// Last committed meta
    meta: RwLock<MetaHeader>,
    /// Pinned snapshot versions and their reference counts
    readers: Mutex<BTreeMap<TxnId, usize>>,
    /// Single-writer lock
    writer: Mutex<WriterState>,
}

impl Environment {
    pub fn builder() -> EnvBuilder {
        EnvBuilder::default()
    }

    /// Open (or create) a database file with default options
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize, readonly: bool) -> Result<Self> {
        let flags = if readonly {
            EnvFlags::RDONLY
        } else {
            EnvFlags::empty()
        };
        Environment::builder()
            .map_size(map_size)
            .flags(flags)
            .open(path)
    }

    fn open_with(path: &Path, options: EnvBuilder) -> Result<Self> {
        let map_size = options.map_size / PAGE_SIZE * PAGE_SIZE;
        if map_size < (META_PAGES + 2) * PAGE_SIZE {
            return Err(Error::InvalidMapSize(options.map_size));
        }
        let readonly = options.flags.contains(EnvFlags::RDONLY);
        let (pager, is_new) = Pager::open(path, map_size, readonly)?;

        let meta = if is_new {
            Self::init_meta_pages(&pager, map_size)?
        } else {
            let slot0 = pager.bytes(0, 1).and_then(|buf| MetaHeader::read_page(buf, 0));
            let slot1 = pager.bytes(1, 1).and_then(|buf| MetaHeader::read_page(buf, 1));
            pick_meta(slot0, slot1)?
        };
        if meta.next_pgno * PAGE_SIZE as u64 > pager.file_size() {
            return Err(Error::CorruptPage {
                pgno: meta.next_pgno,
            });
        }

        let writer = if readonly {
            WriterState::default()
        } else {
            let (freelist, freelist_pages) =
                FreeList::load(&pager, meta.freelist(), meta.next_pgno)?;
            WriterState {
                freelist,
                freelist_pages,
            }
        };

        log::info!(
            "opened {} at txn {} ({} pages, map size {})",
            path.display(),
            meta.txnid,
            meta.next_pgno,
            pager.map_size()
        );

        Ok(Environment {
            path: path.to_path_buf(),
            flags: options.flags,
            max_readers: options.max_readers,
            write_wait: options.write_wait,
            pager,
            meta: RwLock::new(meta),
            readers: Mutex::new(BTreeMap::new()),
            writer: Mutex::new(writer),
        })
    }

    /// Initialize both meta pages of a new file
    fn init_meta_pages(pager: &Pager, map_size: usize) -> Result<MetaHeader> {
        let meta = MetaHeader::new(map_size);
        let mut buf = vec![0u8; PAGE_SIZE];
        for slot in 0..META_PAGES as Pgno {
            meta.write_page(slot, &mut buf);
            pager.write(slot, &buf)?;
        }
        pager.flush()?;
        Ok(meta)
    }

    /// Begin a read-only transaction on the latest committed snapshot
    pub fn begin_read(&self) -> Result<ReadTxn<'_>> {
        ReadTxn::new(self)
    }

    /// Begin the write transaction.
    ///
    /// Only one may be active at a time; what happens under contention is
    /// decided by [`EnvBuilder::write_wait`].
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        let guard = match self.write_wait {
            WriteWait::NoWait => self.writer.try_lock(),
            WriteWait::Block => Some(self.writer.lock()),
            WriteWait::Timeout(timeout) => self.writer.try_lock_for(timeout),
        }
        .ok_or(Error::WriteConflict)?;
        WriteTxn::new(self, guard)
    }

    /// Flush outstanding writes and release the file and the map.
    pub fn close(self) -> Result<()> {
        if !self.is_readonly() && !self.flags.contains(EnvFlags::NOSYNC) {
            self.pager.flush()?;
        }
        log::info!("closed {}", self.path.display());
        Ok(())
    }

    /// Flush the data buffers to disk.
    ///
    /// Commits already flush unless `NOSYNC` or `NOMETASYNC` is set; this
    /// forces the flush in that case when `force` is true.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        if force || !self.flags.contains(EnvFlags::NOSYNC) {
            self.pager.flush()?;
        }
        Ok(())
    }

    /// Set or clear flags that may change after open
    pub fn set_flags(&mut self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::FlagsImmutable);
        }
        if onoff {
            self.flags |= flags;
        } else {
            self.flags &= !flags;
        }
        Ok(())
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(EnvFlags::RDONLY)
    }

    /// Statistics of the latest committed tree
    pub fn stat(&self) -> Stat {
        self.meta.read().stat()
    }

    pub fn info(&self) -> EnvInfo {
        let meta = *self.meta.read();
        EnvInfo {
            map_size: self.pager.map_size(),
            file_size: self.pager.file_size(),
            last_pgno: meta.next_pgno - 1,
            last_txnid: meta.txnid,
            max_readers: self.max_readers,
            num_readers: self.readers.lock().values().sum::<usize>() as u32,
        }
    }

    /// Snapshots currently pinned by read transactions, oldest first
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.readers
            .lock()
            .iter()
            .map(|(&txn_id, &count)| ReaderInfo { txn_id, count })
            .collect()
    }

    /// Write a consistent copy of the latest snapshot to `path`.
    ///
    /// Runs inside a read transaction, so writers may continue meanwhile.
    /// Pages free in the snapshot are written as zeroes.
    pub fn copy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let txn = self.begin_read()?;
        let meta = *txn.meta();
        let (mut freelist, _) = FreeList::load(&self.pager, meta.freelist(), meta.next_pgno)?;
        let free = freelist.take_reclaimable(TxnId::MAX);

        let mut dst = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let mut buf = vec![0u8; PAGE_SIZE];
        for slot in 0..META_PAGES as Pgno {
            meta.write_page(slot, &mut buf);
            dst.write_all(&buf)?;
        }

        let mut pgno = META_PAGES as Pgno;
        while pgno < meta.next_pgno {
            let n = (COPY_CHUNK_PAGES as Pgno).min(meta.next_pgno - pgno) as usize;
            let mut chunk = self.pager.bytes(pgno, n)?.to_vec();
            for i in 0..n {
                if free.contains(pgno + i as Pgno) {
                    chunk[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].fill(0);
                }
            }
            dst.write_all(&chunk)?;
            pgno += n as Pgno;
        }
        dst.sync_all()?;
        txn.close();

        log::info!(
            "copied {} at txn {} to {}",
            self.path.display(),
            meta.txnid,
            path.as_ref().display()
        );
        Ok(())
    }

    /// Library version
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub(crate) fn pager(&self) -> &Pager {
        &self.pager
    }

    pub(crate) fn verify_checksums(&self) -> bool {
        !self.flags.contains(EnvFlags::NOCHECKSUM)
    }

    pub(crate) fn current_meta(&self) -> MetaHeader {
        *self.meta.read()
    }

    /// Pin the current snapshot for a new reader.
    ///
    /// The meta is read under the reader table lock so a writer computing
    /// the oldest snapshot never misses a reader that is being registered.
    pub(crate) fn register_reader(&self) -> Result<MetaHeader> {
        let mut readers = self.readers.lock();
        if readers.values().sum::<usize>() >= self.max_readers as usize {
            return Err(Error::ReadersFull);
        }
        let meta = *self.meta.read();
        *readers.entry(meta.txnid).or_insert(0) += 1;
        Ok(meta)
    }

    /// Release a reader slot
    pub(crate) fn release_reader(&self, txnid: TxnId) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&txnid) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&txnid);
            }
        }
    }

    /// Oldest snapshot any reader can still traverse
    pub(crate) fn oldest_snapshot(&self) -> TxnId {
        let readers = self.readers.lock();
        let current = self.meta.read().txnid;
        readers
            .keys()
            .next()
            .map_or(current, |&oldest| oldest.min(current))
    }

    /// Make a committed meta visible to new readers
    pub(crate) fn publish(&self, meta: MetaHeader) {
        *self.meta.write() = meta;
    }
}
