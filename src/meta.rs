use crate::constants::{
    PageFlags, Pgno, TxnId, FORMAT_VERSION, MAGIC, META_PAGES, PAGE_SIZE, P_INVALID,
};
use crate::error::{Error, Result};
use crate::page::{read_u32, read_u64, seal, write_u32, write_u64, PageHeader};
use crate::types::Stat;

/// Meta header stored in pages 0 and 1.
///
/// A commit with transaction id `t` writes slot `t % 2`, so the previous
/// meta survives a torn write. On open the valid slot with the highest
/// transaction id wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaHeader {
    /// Magic number identifying embedb files
    pub(crate) magic: u32,
    /// Format version
    pub(crate) version: u32,
    /// Page size for this database
    pub(crate) page_size: u32,
    /// Reserved
    pub(crate) flags: u32,
    /// Size of mmap region when last committed
    pub(crate) map_size: u64,
    /// txnid that committed this page
    pub(crate) txnid: TxnId,
    /// Root page number, `P_INVALID` for an empty tree
    pub(crate) root: Pgno,
    /// First page of the persisted free list chain
    pub(crate) freelist: Pgno,
    /// First never-used page in the datafile
    pub(crate) next_pgno: Pgno,
    /// Depth of B-tree
    pub(crate) depth: u32,
    /// Number of data entries
    pub(crate) entries: u64,
    /// Number of branch pages
    pub(crate) branch_pages: u64,
    /// Number of leaf pages
    pub(crate) leaf_pages: u64,
    /// Number of overflow pages
    pub(crate) overflow_pages: u64,
}

// Field offsets inside a meta page
const OFF_MAGIC: usize = 16;
const OFF_VERSION: usize = 20;
const OFF_PAGE_SIZE: usize = 24;
const OFF_FLAGS: usize = 28;
const OFF_MAP_SIZE: usize = 32;
const OFF_TXNID: usize = 40;
const OFF_ROOT: usize = 48;
const OFF_FREELIST: usize = 56;
const OFF_NEXT_PGNO: usize = 64;
const OFF_DEPTH: usize = 72;
const OFF_ENTRIES: usize = 80;
const OFF_BRANCH: usize = 88;
const OFF_LEAF: usize = 96;
const OFF_OVERFLOW: usize = 104;

impl MetaHeader {
    /// Meta of a freshly created, empty database
    pub(crate) fn new(map_size: usize) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            page_size: PAGE_SIZE as u32,
            flags: 0,
            map_size: map_size as u64,
            txnid: 0,
            root: P_INVALID,
            freelist: P_INVALID,
            next_pgno: META_PAGES as Pgno,
            depth: 0,
            entries: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
        }
    }

    pub(crate) fn root(&self) -> Option<Pgno> {
        (self.root != P_INVALID).then_some(self.root)
    }

    pub(crate) fn freelist(&self) -> Option<Pgno> {
        (self.freelist != P_INVALID).then_some(self.freelist)
    }

    /// Slot this meta is written to
    pub(crate) fn slot(&self) -> Pgno {
        self.txnid % META_PAGES as Pgno
    }

    pub(crate) fn stat(&self) -> Stat {
        Stat {
            psize: self.page_size,
            depth: self.depth,
            branch_pages: self.branch_pages as usize,
            leaf_pages: self.leaf_pages as usize,
            overflow_pages: self.overflow_pages as usize,
            entries: self.entries as usize,
        }
    }

    /// Encode into a full page buffer for the given slot
    pub(crate) fn write_page(&self, slot: Pgno, buf: &mut [u8]) {
        buf.fill(0);
        PageHeader::new(slot, PageFlags::META, 0).write(buf);
        write_u32(buf, OFF_MAGIC, self.magic);
        write_u32(buf, OFF_VERSION, self.version);
        write_u32(buf, OFF_PAGE_SIZE, self.page_size);
        write_u32(buf, OFF_FLAGS, self.flags);
        write_u64(buf, OFF_MAP_SIZE, self.map_size);
        write_u64(buf, OFF_TXNID, self.txnid);
        write_u64(buf, OFF_ROOT, self.root);
        write_u64(buf, OFF_FREELIST, self.freelist);
        write_u64(buf, OFF_NEXT_PGNO, self.next_pgno);
        write_u32(buf, OFF_DEPTH, self.depth);
        write_u64(buf, OFF_ENTRIES, self.entries);
        write_u64(buf, OFF_BRANCH, self.branch_pages);
        write_u64(buf, OFF_LEAF, self.leaf_pages);
        write_u64(buf, OFF_OVERFLOW, self.overflow_pages);
        seal(buf);
    }

    /// Decode and validate a meta page. The checksum is always verified.
    pub(crate) fn read_page(buf: &[u8], slot: Pgno) -> Result<Self> {
        let magic = read_u32(buf, OFF_MAGIC);
        if magic != MAGIC {
            return Err(Error::Invalid);
        }
        let version = read_u32(buf, OFF_VERSION);
        if version != FORMAT_VERSION {
            return Err(Error::VersionMismatch(version));
        }
        crate::page::verify(buf, slot, true)?;
        let header = PageHeader::read(buf);
        if !header.flags.contains(PageFlags::META) {
            return Err(Error::CorruptPage { pgno: slot });
        }
        let page_size = read_u32(buf, OFF_PAGE_SIZE);
        if page_size as usize != PAGE_SIZE {
            return Err(Error::Invalid);
        }
        Ok(Self {
            magic,
            version,
            page_size,
            flags: read_u32(buf, OFF_FLAGS),
            map_size: read_u64(buf, OFF_MAP_SIZE),
            txnid: read_u64(buf, OFF_TXNID),
            root: read_u64(buf, OFF_ROOT),
            freelist: read_u64(buf, OFF_FREELIST),
            next_pgno: read_u64(buf, OFF_NEXT_PGNO),
            depth: read_u32(buf, OFF_DEPTH),
            entries: read_u64(buf, OFF_ENTRIES),
            branch_pages: read_u64(buf, OFF_BRANCH),
            leaf_pages: read_u64(buf, OFF_LEAF),
            overflow_pages: read_u64(buf, OFF_OVERFLOW),
        })
    }
}

/// Pick the authoritative meta out of the two slots
pub(crate) fn pick_meta(slot0: Result<MetaHeader>, slot1: Result<MetaHeader>) -> Result<MetaHeader> {
    match (slot0, slot1) {
        (Ok(m0), Ok(m1)) => Ok(if m1.txnid > m0.txnid { m1 } else { m0 }),
        (Ok(m), Err(e)) | (Err(e), Ok(m)) => {
            log::warn!("falling back to meta of txn {}: other slot invalid ({})", m.txnid, e);
            Ok(m)
        }
        (Err(e0), Err(_)) => Err(e0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_page_round_trip() {
        let mut meta = MetaHeader::new(1 << 20);
        meta.txnid = 5;
        meta.root = 17;
        meta.entries = 3;
        let mut buf = vec![0u8; PAGE_SIZE];
        meta.write_page(meta.slot(), &mut buf);
        assert_eq!(meta.slot(), 1);
        assert_eq!(MetaHeader::read_page(&buf, 1).unwrap(), meta);
        assert_eq!(&buf[OFF_TXNID..OFF_TXNID + 8], &5u64.to_le_bytes());
    }

    #[test]
    fn test_read_page_rejects_garbage() {
        let buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(MetaHeader::read_page(&buf, 0), Err(Error::Invalid)));

        let mut buf = vec![0u8; PAGE_SIZE];
        MetaHeader::new(1 << 20).write_page(0, &mut buf);
        buf[OFF_ROOT] ^= 1;
        assert!(matches!(
            MetaHeader::read_page(&buf, 0),
            Err(Error::CorruptPage { pgno: 0 })
        ));
    }

    #[test]
    fn test_pick_meta_prefers_newest_valid() {
        let mut old = MetaHeader::new(1 << 20);
        old.txnid = 4;
        let mut new = old;
        new.txnid = 5;
        assert_eq!(pick_meta(Ok(old), Ok(new)).unwrap().txnid, 5);
        assert_eq!(
            pick_meta(Ok(old), Err(Error::CorruptPage { pgno: 1 })).unwrap().txnid,
            4
        );
        assert!(pick_meta(Err(Error::Invalid), Err(Error::Invalid)).is_err());
    }
}
